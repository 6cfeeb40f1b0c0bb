pub mod codec;
pub mod coordinator;
pub mod protocol;
pub mod transport;

pub use codec::{ColumnarCodec, JsonRowsDecoder, RowDecoder};
pub use coordinator::{Completion, CoordinatorStats, FetchCoordinator, FetchHandle, FetchedRows};
pub use protocol::{FetchRequest, FetchResponse, ResponseBody, ResponseFrame};
pub use transport::{channel, BackendPort, ChannelTransport, Transport};
