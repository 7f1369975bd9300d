pub mod job;
pub mod job_status;
pub mod record;
pub mod source;

pub use job::*;
pub use job_status::*;
pub use record::*;
pub use source::*;
