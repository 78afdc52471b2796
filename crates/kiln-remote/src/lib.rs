//! Remote script execution for kiln
//!
//! Builds ordered script collections and runs them on one host over SSH,
//! verifying the host fingerprint out of band before authenticating.

#![deny(missing_docs)]

pub mod engine;
pub mod fingerprint;
pub mod keypair;
pub mod script;
pub mod transport;

pub use engine::{
    single_output, ConnectionRequest, ExecutorFactory, RemoteExecutor, SshEngine,
    SshExecutorFactory, FAKE_STDOUT,
};
pub use keypair::generate_key_pair;
pub use script::{Executor, Script, ScriptCollection};
