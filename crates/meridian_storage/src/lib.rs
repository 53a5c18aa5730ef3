pub mod clog;
pub mod distributed_log;
pub mod smgr;
pub mod subtrans;
pub mod xact_record;
pub mod xlog;

pub use clog::{CommitLog, XidStatus};
pub use distributed_log::{DistributedLog, DistributedLogEntry};
pub use smgr::{FsStorageManager, NullStorageManager, StorageManager};
pub use subtrans::SubTransLog;
pub use xlog::{DurableLog, FileLog, MemLog, XlogRecord};
