//! Node identity and signed envelopes.

use sentinel_types::{FederationNode, Message, MessageType};
use serde_json::Value;
use tracing::trace;

use crate::{verify_hex, KeyPair};

/// Long-lived identity of the local node: its id, region and signing key.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    node_id: String,
    region: String,
    keypair: KeyPair,
}

impl NodeIdentity {
    pub fn new<I: Into<String>, R: Into<String>>(node_id: I, region: R, keypair: KeyPair) -> Self {
        Self {
            node_id: node_id.into(),
            region: region.into(),
            keypair,
        }
    }

    /// Identity with a freshly generated key pair.
    pub fn generate<I: Into<String>, R: Into<String>>(node_id: I, region: R) -> Self {
        Self::new(node_id, region, KeyPair::generate())
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn public_key_hex(&self) -> String {
        self.keypair.public_key_hex()
    }

    /// Fresh descriptor for this node.
    pub fn descriptor(&self) -> FederationNode {
        FederationNode::new(
            self.node_id.clone(),
            self.region.clone(),
            self.public_key_hex(),
        )
    }

    /// Build and sign an envelope from this node.
    pub fn create_message<R: Into<String>>(
        &self,
        message_type: MessageType,
        payload: Value,
        recipient: R,
    ) -> Message {
        let mut message = Message::unsigned(message_type, self.node_id.clone(), recipient, payload);
        self.sign(&mut message);
        message
    }

    /// (Re)sign `message` over its canonical bytes.
    pub fn sign(&self, message: &mut Message) {
        message.signature = self.keypair.sign_hex(&message.signing_bytes());
    }
}

/// Check an envelope's signature against a hex-encoded public key.
pub fn verify_message_signature(message: &Message, public_key_hex: &str) -> bool {
    match verify_hex(public_key_hex, &message.signing_bytes(), &message.signature) {
        Ok(()) => true,
        Err(err) => {
            trace!(message_id = %message.id, error = %err, "signature check failed");
            false
        }
    }
}
