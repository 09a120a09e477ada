use anyhow::Result;
use boyka::session::SessionHandle;

use crate::render;

/// Answer a single message and exit
pub async fn execute(handle: SessionHandle, text: String) -> Result<()> {
    if let Err(e) = super::drive_turn(&handle, &text).await {
        render::error(&e.to_string());
        return Err(e);
    }
    Ok(())
}
