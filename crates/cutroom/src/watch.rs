//! Follow notifications and chat live until interrupted.

use std::collections::HashSet;

use cutroom_sync::{EnginePhase, Toast};
use miette::Result;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tracing::{info, warn};

use crate::app::{App, AppOptions};
use crate::commands::format_message;

fn print_toast(toast: &Toast) {
    match &toast.link {
        Some(link) => println!("[{}] {}: {} ({})", toast.kind, toast.title, toast.body, link),
        None => println!("[{}] {}: {}", toast.kind, toast.title, toast.body),
    }
}

pub async fn run(options: &AppOptions) -> Result<()> {
    let app = App::start(options).await?;
    if app.studio.sessions().current().is_none() {
        app.shutdown().await;
        return Err(miette::miette!("not logged in; run `cutroom login <email>`"));
    }
    let studio = &app.studio;

    let mut toasts = BroadcastStream::new(studio.notifications().toasts());
    let mut chat = WatchStream::new(studio.chat().watch());
    let mut unread = WatchStream::new(studio.notifications().watch());

    // Messages already in the window when the first snapshot lands are shown
    // once; after that only new ones print.
    let mut seen: HashSet<String> = HashSet::new();
    let mut last_unread = None;

    info!("watching; press ctrl-c to stop");
    loop {
        tokio::select! {
            biased;

            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal");
                break;
            }

            Some(toast) = toasts.next() => match toast {
                Ok(toast) => print_toast(&toast),
                Err(BroadcastStreamRecvError::Lagged(n)) => {
                    warn!(skipped = n, "toast stream lagged");
                }
            },

            Some(summary) = chat.next() => {
                if summary.phase != EnginePhase::Live {
                    continue;
                }
                for message in summary.messages.iter() {
                    if seen.insert(message.id.clone()) {
                        println!("{}", format_message(message));
                    }
                }
            }

            Some(summary) = unread.next() => {
                if summary.phase == EnginePhase::Live && last_unread != Some(summary.unread) {
                    println!("-- {} unread notification(s)", summary.unread);
                    last_unread = Some(summary.unread);
                }
            }

            else => break,
        }
    }

    app.shutdown().await;
    Ok(())
}
