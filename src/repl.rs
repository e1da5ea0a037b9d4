use futures::{ Stream, StreamExt };
use log::info;
use std::error::Error;
use std::future::Future;
use std::io::{ self, Write };
use tokio::io::{ AsyncBufReadExt, BufReader };
use tokio_stream::wrappers::LinesStream;

use crate::llm::CompletionError;
use crate::session::{ compare, ChatSession, Interruption, TurnOutcome };

async fn ctrl_c() {
    if tokio::signal::ctrl_c().await.is_err() {
        // No signal handler available; never stop early.
        std::future::pending::<()>().await;
    }
}

fn print_fragment(fragment: &str) {
    let mut stdout = std::io::stdout();
    let _ = write!(stdout, "{}", fragment);
    let _ = stdout.flush();
}

fn report(result: Result<TurnOutcome, CompletionError>) {
    println!();
    match result {
        Ok(outcome) =>
            match outcome.interruption {
                None => {}
                Some(Interruption::Stopped) => eprintln!("[stopped]"),
                Some(Interruption::Failed(e)) => eprintln!("[reply interrupted: {}]", e),
            }
        Err(e @ CompletionError::TokenBudgetExceeded { .. }) => {
            eprintln!("{}", e);
            eprintln!("Type /clear to start a new conversation.");
        }
        Err(e) => eprintln!("Error: {}", e),
    }
}

fn print_greeting(session: &ChatSession) {
    if let Some(turn) = session.history().last() {
        println!("{}", turn.content);
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Input {
    Line(String),
    Quit,
}

/// Waits for the next prompt line. End of input or `interrupt` firing while
/// the prompt is idle both quit.
async fn next_input<L, I>(lines: &mut L, interrupt: I) -> io::Result<Input>
    where L: Stream<Item = io::Result<String>> + Unpin, I: Future<Output = ()>
{
    tokio::select! {
        biased;
        _ = interrupt => Ok(Input::Quit),
        line = lines.next() => match line {
            Some(line) => Ok(Input::Line(line?)),
            None => Ok(Input::Quit),
        },
    }
}

/// Line-oriented chat loop over stdin. `/clear` resets the conversation,
/// `/exit`, end of input or Ctrl-C at the prompt quits, Ctrl-C during a
/// reply stops it.
pub async fn run_repl(
    mut primary: ChatSession,
    mut secondary: Option<ChatSession>
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
    print_greeting(&primary);

    loop {
        print_fragment("> ");
        let Input::Line(line) = next_input(&mut lines, ctrl_c()).await? else {
            println!();
            break;
        };
        match line.trim() {
            "" => {
                continue;
            }
            "/exit" | "/quit" => {
                break;
            }
            "/clear" => {
                primary.clear();
                if let Some(second) = secondary.as_mut() {
                    second.clear();
                }
                info!("Chat history cleared");
                print_greeting(&primary);
                continue;
            }
            _ => {}
        }

        match secondary.as_mut() {
            None => {
                let result = primary.send(&line, print_fragment, ctrl_c()).await;
                report(result);
            }
            Some(second) => {
                let labels = [primary.label(), second.label()];
                let mut current = None;
                let results = compare(
                    [&mut primary, second],
                    &line,
                    |idx, fragment| {
                        if current != Some(idx) {
                            current = Some(idx);
                            println!("\n[{}]", labels[idx]);
                        }
                        print_fragment(fragment);
                    },
                    ctrl_c
                ).await;
                for (label, result) in labels.iter().zip(results) {
                    if !matches!(result, Ok(ref outcome) if outcome.is_complete()) {
                        eprint!("[{}] ", label);
                    }
                    report(result);
                }
            }
        }
    }

    Ok(())
}
