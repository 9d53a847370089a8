use async_trait::async_trait;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
/// A reply ready to go back out through the originating channel.
pub struct OutboundReply {
    pub session_key: String,
    pub run_id: u64,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
/// Platform ids of the messages a delivery produced. A channel that
/// redelivers our own messages reports them back under these ids.
pub struct DeliveryReceipt {
    pub message_ids: Vec<String>,
}

/// Channel-adapter seam for delivering replies.
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn deliver(&self, reply: &OutboundReply) -> anyhow::Result<DeliveryReceipt>;
}
