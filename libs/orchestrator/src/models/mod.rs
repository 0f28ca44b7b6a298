pub mod exec;
pub mod execution;
pub mod pod;
pub mod session;
pub mod state;

pub use exec::{ExecRequest, ExecResponse, FileRef, RequestFile};
pub use execution::{Execution, ExecutionOutput, ExecutionStatus, OutputType};
pub use pod::{PodHandle, PodSource, PodStatus, PooledPod};
pub use session::{FileInfo, Session, SessionStatus};
pub use state::{StateInfo, StateSource, StateUpload};
