/*!
rcode lets a process on a remote host ask the user's local machine to open
an IDE on a remote-relative path, without the remote host being able to
reach the local machine directly. A private control channel rides an ssh
connection's reverse port forward; a small long-lived broker on the local
machine authenticates sessions and dispatches requests.

Crate layout:
- [`protocol`] — sentinel-framed JSON envelopes shared by both sides.
- [`session`] — the authenticated session table and its liveness oracle.
- [`broker`] — the accept/sweep server loop and request dispatch.
- [`client`] — one-shot framed client, with spawn-on-demand retry.
- [`bridge`] — the ssh argv rewrite and process hand-off (`rssh`).
- [`ide`] — remote-side caller, local launcher, and discovery fallbacks.
- [`config`], [`logging`], [`errors`] — ambient plumbing.
- [`shortcuts`], [`sshconf`], [`util`] — collaborator helpers.
*/

pub mod bridge;
pub mod broker;
pub mod client;
pub mod config;
pub mod errors;
pub mod ide;
pub mod logging;
pub mod protocol;
pub mod session;
pub mod shortcuts;
pub mod sshconf;
pub mod util;

pub use broker::{broker_start_background, BrokerServer, Dispatcher};
pub use client::{connect_with_retry, BrokerClient};
pub use config::Config;
pub use errors::{
    display_for_broker_error, exit_code_for_broker_error, exit_code_for_io_error, BrokerError,
};
pub use ide::is_remote_context;
pub use protocol::{OpenIdeParams, Request, Response, SessionData, SessionParams, DELIMITER};
pub use session::{ProcessOracle, SessionRegistry, SystemProcessOracle};
