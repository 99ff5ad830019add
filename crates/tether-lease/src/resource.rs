use crate::error::ResourceError;

/// The single shared backend handle (e.g. a database connection).
///
/// Every outstanding reservation sees the same instance, so implementations
/// serialize their own internal use. After `close` returns, further use must
/// report [`ResourceError::Closed`] rather than misbehave: a cancelled body
/// that ignores its cancellation may still touch the handle.
pub trait Resource: Send + Sync + 'static {
    fn close(&self) -> Result<(), ResourceError>;
}

/// Opens the shared resource on demand.
///
/// `open` may block on network or disk I/O; the registry always calls it on
/// the blocking pool and never while holding its lock.
pub trait ResourceFactory: Send + Sync + 'static {
    type Resource: Resource;

    fn open(&self) -> Result<Self::Resource, ResourceError>;

    /// Connection target for log lines. Must not include secrets.
    fn describe(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }
}
