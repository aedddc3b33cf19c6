pub mod proto;

use crate::common::Endpoint;
pub use proto::Message;

/// The physical neighbor table. The membership layer decides *what* to send
/// and to whom; the embedder owns connections, framing and retries at the
/// byte level.
#[async_trait::async_trait]
pub trait Transport: Send + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Send to one connected neighbor. An error means the neighbor is not
    /// currently reachable; the protocol compensates (gossip retries, the
    /// update batch stays queued, pending requests are re-pushed).
    async fn send_to_neighbor(
        &mut self,
        dst: Endpoint,
        msg: Message,
    ) -> Result<(), Self::Error>;

    /// Best-effort broadcast to every routable neighbor. Returns
    /// `(sent, total)`; the caller treats `sent == total` as a fully
    /// successful round.
    async fn send_to_all(&mut self, msg: Message) -> (usize, usize);
}
