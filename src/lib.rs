pub mod agent;
pub mod cli;
pub mod core;
pub mod protocol;

use std::time::Duration;

use agent::Agent;
use protocol::Writer;

/// Builds the agent and runs its mainloop to completion, returning the
/// process exit status. Kept separate from `main` so integration tests can
/// drive an `Agent` against an in-memory stdout sink.
pub async fn run(autopoll_interval: Duration) -> i32 {
    let writer = Writer::new(Box::new(std::io::stdout()));
    let agent = Agent::new(writer, autopoll_interval);
    agent.run().await
}
