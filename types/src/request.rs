use serde_derive::{Deserialize, Serialize};

/// Attributes a request carries through the retrieval pipeline. `hops` is
/// incremented each time the request is forwarded to another gateway;
/// `origin` identifies the first gateway in the chain and is never rewritten.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestAttributes {
    pub hops: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_node_release: Option<String>,
}

impl RequestAttributes {
    /// The attributes to forward upstream: one more hop, origin untouched.
    pub fn forwarded(&self) -> Self {
        Self {
            hops: self.hops + 1,
            origin: self.origin.clone(),
            origin_node_release: self.origin_node_release.clone(),
        }
    }
}
