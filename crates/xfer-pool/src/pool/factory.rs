//! How a pool obtains and checks its clients.

use xfer_engine::TransferResult;

/// Protocol-specific connection establishment, handed to a
/// [`ConnectionPool`](crate::ConnectionPool) at construction.
///
/// All methods are called without any pool lock held, so they may block on
/// the network. Their duration is bounded only by the timeouts the client
/// itself enforces.
pub trait ConnectionFactory: Send + Sync + 'static {
    type Client: Send + 'static;

    /// Open and authenticate a new client.
    fn connect(&self) -> TransferResult<Self::Client>;

    /// Lightweight no-op round trip proving the client is still usable.
    fn probe(&self, client: &mut Self::Client) -> TransferResult<()>;

    /// Tear down a client leaving the pool. Errors are not reported.
    fn disconnect(&self, client: Self::Client) {
        drop(client);
    }

    /// Short label for log lines (`user@host:port`).
    fn describe(&self) -> String {
        String::from("remote")
    }
}
