use crate::api::{self, ServerOptions};
use anyhow::Result;

/// Execute the server action.
/// # Errors
/// Returns an error if configuration fails to load or the server fails to
/// start.
pub async fn execute(options: ServerOptions) -> Result<()> {
    api::serve(options).await
}
