use anyhow::Result;
use boyka::session::SessionHandle;
use console::style;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::render;

const PROMPT: &str = "\x1b[1m\x1b[38;5;30mboyka> \x1b[0m";

enum Input {
    Message(String),
    Clear,
    Exit,
    AskAgain,
}

fn parse_input(line: &str) -> Input {
    match line.trim() {
        "" => Input::AskAgain,
        "exit" | "quit" | "/exit" => Input::Exit,
        "/clear" => Input::Clear,
        text => Input::Message(text.to_string()),
    }
}

/// Interactive conversation until the user exits
pub async fn execute(handle: SessionHandle) -> Result<()> {
    let mut editor = DefaultEditor::new()?;
    println!(
        "{}",
        style("Type a message, \"/clear\" to start over, \"exit\" to quit.").dim()
    );

    loop {
        let line = match editor.readline(PROMPT) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        };

        match parse_input(&line) {
            Input::AskAgain => continue,
            Input::Exit => break,
            Input::Clear => {
                handle.clear().await?;
                println!("{}", style("Conversation cleared.").dim());
            }
            Input::Message(text) => {
                editor.add_history_entry(text.as_str())?;
                // a failed turn is reported and the session carries on
                if let Err(e) = super::drive_turn(&handle, &text).await {
                    render::error(&e.to_string());
                }
            }
        }
    }

    Ok(())
}
