pub mod device;
pub mod error;
pub mod ingest;
pub mod media;
pub mod protocol;
pub mod scope;
pub mod session;
pub mod transport;

pub use device::{DeviceState, GbSession, GbSessionConfig, GbSessionOutput, SessionEvent};
pub use error::{GbError, Result, ResultExt, filter_errors};
pub use ingest::{IngestReport, IngestStop, IngesterConfig, PsConfig, PsIngester};
pub use scope::Scope;
pub use session::{SipConfig, SipSession};
