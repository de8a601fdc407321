mod dispatcher;
mod folder;
mod tests;
mod transport;

pub use dispatcher::{
    DispatchError, Dispatcher, DISPATCH_OPERATION, INBOUND_QUEUE, OUTBOUND_QUEUE, REQUEST_CACHE,
    SEND_OPERATION,
};
pub use folder::FolderTransport;
pub use transport::{Transport, TransportError};
