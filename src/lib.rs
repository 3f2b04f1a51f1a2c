//! ferny-agent: structured side channel between a controlling process and a
//! subprocess's helper programs (typically ssh and its askpass helper).
//!
//! The subprocess's stderr is one end of a local stream socket. Ordinary
//! diagnostic text flows through it as usual; helpers interleave commands,
//! which the [`InteractionAgent`] frames and hands to a [`Responder`].
//!
//! Helper side:
//!
//! ```no_run
//! use ferny_agent::{send_command, END_COMMAND};
//!
//! send_command(std::io::stderr(), END_COMMAND, &[], &[])?;
//! # Ok::<(), ferny_agent::Error>(())
//! ```

pub mod agent;
pub mod error;
pub mod framer;
pub mod literal;
pub mod protocol;
pub mod responder;
pub mod sender;
pub mod status;
pub mod transport;

pub use agent::{Completion, InteractionAgent};
pub use error::{Error, Result};
pub use literal::Literal;
pub use protocol::{AgentConfig, Command, ASKPASS_COMMAND, END_COMMAND};
pub use responder::{AskRequest, HostKeyQuery, HostKeyReason, Responder};
pub use sender::{askpass, encode_remote, send_command, WireForm};
pub use status::StatusChannel;
