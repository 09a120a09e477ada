pub mod run;
pub mod session;

use anyhow::Result;
use boyka::agent::TurnOutcome;
use boyka::session::SessionHandle;

use crate::render;

/// Send one message and render its events until the turn ends. Ctrl-C
/// cancels the turn instead of killing the process.
pub async fn drive_turn(handle: &SessionHandle, text: &str) -> Result<TurnOutcome> {
    let mut turn = handle.send(text).await?;
    let cancel = turn.cancel_token();

    loop {
        tokio::select! {
            event = turn.next_event() => match event {
                Some(event) => render::event(&event),
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !cancel.is_cancelled() => {
                cancel.cancel();
                render::notice_line("Interrupt: cancelling the current request...");
            }
        }
    }

    let outcome = turn.outcome().await?;
    render::finish(&outcome);
    Ok(outcome)
}
