//! Physical connection seam.
//!
//! The pool never talks to a driver directly. It opens connections through a
//! [`Connector`] and runs statements through [`PhysicalConnection`], which keeps the
//! pooling and execution logic independent of any one database.

use crate::error::DbResult;
use crate::models::{Statement, StatementResult};
use std::future::Future;

/// One open connection to a database.
pub trait PhysicalConnection: Send + 'static {
    /// Run a single statement on this connection.
    fn run(
        &mut self,
        statement: &Statement,
    ) -> impl Future<Output = DbResult<StatementResult>> + Send;

    /// Check that the connection is still usable.
    fn ping(&mut self) -> impl Future<Output = DbResult<()>> + Send;

    /// Gracefully close the connection.
    fn close(self) -> impl Future<Output = DbResult<()>> + Send
    where
        Self: Sized;
}

/// Opens physical connections for a pool.
pub trait Connector: Send + Sync + 'static {
    type Connection: PhysicalConnection;

    fn connect(&self) -> impl Future<Output = DbResult<Self::Connection>> + Send;
}
