pub mod server;

use crate::api::ServerOptions;

#[derive(Debug)]
pub enum Action {
    Server(Box<ServerOptions>),
}

impl Action {
    /// Execute the action.
    /// # Errors
    /// Returns an error if the action fails.
    pub async fn execute(self) -> anyhow::Result<()> {
        match self {
            Self::Server(options) => server::execute(*options).await,
        }
    }
}
