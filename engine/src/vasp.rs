// Root object of one VASP: owns the shared store, the payment processor
// and one channel per peer. Channels are created lazily and replay their
// command log on first access so a restarted process resumes where it
// stopped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::info;

use offchain_common::crypto::OffChainAddress;
use offchain_common::payment::PaymentObject;

use crate::channel::{ChannelError, VaspPairChannel};
use crate::network::CommandNetwork;
use crate::processor::{
    BusinessContext, CommandProcessor, PaymentOutcomeError, PaymentProcessor, ProcessorError,
};
use crate::signer::EnvelopeSigner;
use crate::storage::Database;
use crate::store::PaymentStore;

pub struct OffChainVasp<B: BusinessContext> {
    my_address: OffChainAddress,
    signer: Arc<dyn EnvelopeSigner>,
    db: Arc<dyn Database>,
    store: Arc<PaymentStore>,
    processor: Arc<PaymentProcessor<B>>,
    // peer encoded address -> channel, one instance per peer
    channels: Mutex<HashMap<String, Arc<VaspPairChannel>>>,
}

impl<B: BusinessContext> OffChainVasp<B> {
    pub fn new(business: Arc<B>, signer: Arc<dyn EnvelopeSigner>, db: Arc<dyn Database>) -> Self {
        let my_address = business.get_my_address().onchain_address();
        let store = Arc::new(PaymentStore::new(Arc::clone(&db), &my_address));
        let processor = Arc::new(PaymentProcessor::new(business, Arc::clone(&store)));
        Self {
            my_address,
            signer,
            db,
            store,
            processor,
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn my_address(&self) -> &OffChainAddress {
        &self.my_address
    }

    pub fn processor(&self) -> &Arc<PaymentProcessor<B>> {
        &self.processor
    }

    pub fn store(&self) -> &Arc<PaymentStore> {
        &self.store
    }

    /// Assign the transport used to emit follow-up commands
    pub fn set_network(&self, net: Arc<dyn CommandNetwork>) -> Result<(), ProcessorError> {
        self.processor.set_network(net)
    }

    /// The channel with `other`, created on first access. A new channel
    /// replays its durable command log through the processor before use.
    pub fn get_channel(
        &self,
        other: &OffChainAddress,
    ) -> Result<Arc<VaspPairChannel>, ChannelError> {
        let other = other.onchain_address();
        let mut channels = self
            .channels
            .lock()
            .map_err(|_| ChannelError::Invariant("channel registry lock poisoned".to_owned()))?;

        if let Some(channel) = channels.get(&other.as_str()) {
            return Ok(Arc::clone(channel));
        }

        let channel = Arc::new(VaspPairChannel::new(
            self.my_address.clone(),
            other.clone(),
            Arc::clone(&self.processor) as Arc<dyn CommandProcessor>,
            Arc::clone(&self.signer),
            Arc::clone(&self.store),
            Arc::clone(&self.db),
        )?);
        let replayed = channel.replay_committed()?;
        if replayed > 0 {
            info!(
                "(other:{}) channel recovered with {} committed commands",
                other, replayed
            );
        }
        channels.insert(other.as_str(), Arc::clone(&channel));
        Ok(channel)
    }

    /// Wait for the payment to reach a final state
    pub async fn wait_for_payment_outcome(
        &self,
        reference_id: &str,
    ) -> Result<PaymentObject, PaymentOutcomeError> {
        self.processor.wait_for_payment_outcome(reference_id).await
    }
}
