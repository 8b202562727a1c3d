use std::io::Write;

use anyhow::Context;
use docchat_rag::{CompletionStream, RagChain};
use futures::StreamExt;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tracing::warn;

use crate::render_sources;

const PROMPT: &str = "you> ";

#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Question(&'a str),
    Sources,
    Clear,
    Help,
    Quit,
    Empty,
}

fn parse(line: &str) -> Input<'_> {
    match line.trim() {
        "" => Input::Empty,
        "/quit" | "/exit" | "exit" | "quit" => Input::Quit,
        "/sources" => Input::Sources,
        "/clear" => Input::Clear,
        "/help" | "?" => Input::Help,
        question => Input::Question(question),
    }
}

/// Reads questions until EOF, Ctrl-C or `/quit`.
pub async fn run(chain: &RagChain) -> anyhow::Result<()> {
    let mut editor = DefaultEditor::new().context("failed to open terminal")?;
    let mut show_sources = false;

    println!("Ask me anything about the document. /help lists commands.");
    loop {
        let line = match editor.readline(PROMPT) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(err) => return Err(err).context("failed to read input"),
        };

        match parse(&line) {
            Input::Empty => continue,
            Input::Quit => break,
            Input::Help => {
                println!("/sources  toggle the list of retrieved passages");
                println!("/clear    clear the screen and input history");
                println!("/quit     leave");
            }
            Input::Sources => {
                show_sources = !show_sources;
                println!("sources {}", if show_sources { "on" } else { "off" });
            }
            Input::Clear => {
                editor.clear_history().context("failed to clear history")?;
                editor.clear_screen().context("failed to clear screen")?;
            }
            Input::Question(question) => {
                let _ = editor.add_history_entry(question);
                println!("Searching knowledge base...");
                let answer = match chain.answer_stream(question).await {
                    Ok(answer) => answer,
                    Err(err) => {
                        warn!(error = %err, "answer failed");
                        println!("{}\n", err.user_message());
                        continue;
                    }
                };
                let mut stdout = std::io::stdout();
                match write_tokens(&mut stdout, answer.tokens).await {
                    Ok(_) if show_sources && !answer.context.is_empty() => {
                        println!("\n\n{}", render_sources(&answer.context));
                    }
                    Ok(_) => println!("\n"),
                    Err(err) => {
                        warn!(error = %err, "answer stream failed");
                        println!("\n{}\n", err.user_message());
                    }
                }
            }
        }
    }
    Ok(())
}

/// Writes each delta to `out` as it arrives, returning the whole answer.
async fn write_tokens<W: Write>(out: &mut W, mut tokens: CompletionStream) -> docchat_rag::Result<String> {
    let mut text = String::new();
    while let Some(delta) = tokens.next().await {
        let delta = delta?;
        out.write_all(delta.as_bytes())?;
        out.flush()?;
        text.push_str(&delta);
    }
    Ok(text)
}
