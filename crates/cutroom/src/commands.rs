//! One-shot commands.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use cutroom_store::{
    ChatMessage, MediaClient, OptimizeOptions, UploadOptions, derive_optimized_url,
    derive_thumbnail_url,
};
use cutroom_sync::chat::parse_segments;
use cutroom_sync::{
    ChatSummary, Draft, EnginePhase, EntityKind, NotificationSummary, Segment, Studio,
};
use miette::Result;
use tokio::sync::watch;

use crate::app::{App, AppOptions};

/// How long to wait for the first live snapshot.
const FIRST_SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(15);

/// Square thumbnail edge printed after an upload.
const THUMBNAIL_SIZE: u32 = 320;

async fn wait_live<T: Clone>(
    mut rx: watch::Receiver<T>,
    is_live: impl Fn(&T) -> bool,
    what: &str,
) -> Result<T> {
    match tokio::time::timeout(FIRST_SNAPSHOT_TIMEOUT, rx.wait_for(|s| is_live(s))).await {
        Ok(Ok(summary)) => Ok(summary.clone()),
        Ok(Err(_)) => Err(miette::miette!("{} feed closed", what)),
        Err(_) => Err(miette::miette!("timed out waiting for {}", what)),
    }
}

async fn live_notifications(studio: &Studio) -> Result<NotificationSummary> {
    wait_live(
        studio.notifications().watch(),
        |s: &NotificationSummary| s.phase == EnginePhase::Live,
        "notifications",
    )
    .await
}

async fn live_chat(studio: &Studio) -> Result<ChatSummary> {
    wait_live(
        studio.chat().watch(),
        |s: &ChatSummary| s.phase == EnginePhase::Live,
        "chat",
    )
    .await
}

fn require_session(studio: &Studio) -> Result<()> {
    if studio.sessions().current().is_none() {
        return Err(miette::miette!("not logged in; run `cutroom login <email>`"));
    }
    Ok(())
}

/// Render message content with mentions and references marked up.
pub fn render_message(message: &ChatMessage) -> String {
    parse_segments(&message.content, &message.mentions, &message.references)
        .iter()
        .map(|segment| match segment {
            Segment::Text(text) => text.clone(),
            Segment::Mention { name } => format!("*@{}*", name),
            Segment::Reference {
                target: Some(target),
                ..
            } => format!("[{}]({})", segment.raw(), cutroom_sync::chat::route_for(target)),
            Segment::Reference { .. } => segment.raw(),
        })
        .collect()
}

pub fn format_message(message: &ChatMessage) -> String {
    let at = message
        .created_at
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "pending".to_string());
    format!("{} {}: {}", at, message.sender_name, render_message(message))
}

pub async fn login(options: &AppOptions, email: &str) -> Result<()> {
    let app = App::start(options).await?;
    let session = app
        .studio
        .sessions()
        .login(email)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    println!("Logged in as {} <{}> ({})", session.name, session.email, session.role);
    app.shutdown().await;
    Ok(())
}

pub async fn logout(options: &AppOptions) -> Result<()> {
    let app = App::start(options).await?;
    app.studio
        .sessions()
        .logout()
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    println!("Logged out");
    app.shutdown().await;
    Ok(())
}

pub async fn whoami(options: &AppOptions) -> Result<()> {
    let app = App::start(options).await?;
    match app.studio.sessions().current() {
        Some(session) => println!(
            "{} <{}> ({}) id={}",
            session.name, session.email, session.role, session.id
        ),
        None => println!("Not logged in"),
    }
    app.shutdown().await;
    Ok(())
}

pub async fn chat_send(options: &AppOptions, text: &str) -> Result<()> {
    let app = App::start(options).await?;
    require_session(&app.studio)?;

    let draft = Draft::from_text(text, &app.studio.chat().lookups());
    let mentioned = draft.mentions.len();
    let id = app
        .studio
        .chat()
        .send(draft)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    println!("Sent {} ({} mentioned)", id, mentioned);
    app.shutdown().await;
    Ok(())
}

pub async fn chat_history(options: &AppOptions, limit: usize, mark_read: bool) -> Result<()> {
    let app = App::start(options).await?;
    require_session(&app.studio)?;

    let summary = live_chat(&app.studio).await?;
    let skip = summary.messages.len().saturating_sub(limit);
    for message in summary.messages.iter().skip(skip) {
        println!("{}", format_message(message));
    }
    println!("{} unread", summary.unread);

    if mark_read {
        app.studio
            .chat()
            .open()
            .await
            .map_err(|e| miette::miette!("{}", e))?;
        app.studio.chat().close();
    }
    app.shutdown().await;
    Ok(())
}

pub async fn notifications_list(options: &AppOptions) -> Result<()> {
    let app = App::start(options).await?;
    require_session(&app.studio)?;

    let summary = live_notifications(&app.studio).await?;
    for n in summary.notifications.iter() {
        let marker = if n.read { " " } else { "*" };
        let at = n
            .created_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "pending".to_string());
        println!("{} {} {} [{}] {}: {}", marker, n.id, at, n.kind, n.title, n.body);
    }
    println!("{} unread of {}", summary.unread, summary.notifications.len());
    app.shutdown().await;
    Ok(())
}

pub async fn notifications_read_all(options: &AppOptions) -> Result<()> {
    let app = App::start(options).await?;
    require_session(&app.studio)?;

    live_notifications(&app.studio).await?;
    let count = app
        .studio
        .notifications()
        .mark_all_read()
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    println!("Marked {} notification(s) read", count);
    app.shutdown().await;
    Ok(())
}

pub async fn notifications_delete_all(options: &AppOptions) -> Result<()> {
    let app = App::start(options).await?;
    require_session(&app.studio)?;

    live_notifications(&app.studio).await?;
    let count = app
        .studio
        .notifications()
        .delete_all()
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    println!("Deleted {} notification(s)", count);
    app.shutdown().await;
    Ok(())
}

/// One `id<TAB>name` line per cached entity.
async fn entity_lines(studio: &Studio, kind: EntityKind) -> Vec<String> {
    use cutroom_store::{Client, PostProduction, Project, Script, Video};

    let caches = studio.caches();
    match kind {
        EntityKind::Project => caches
            .fetch::<Project>(false)
            .await
            .iter()
            .map(|p| format!("{}\t{}", p.id, p.display_name()))
            .collect(),
        EntityKind::Video => caches
            .fetch::<Video>(false)
            .await
            .iter()
            .map(|v| format!("{}\t{}", v.id, v.display_title()))
            .collect(),
        EntityKind::Script => caches
            .fetch::<Script>(false)
            .await
            .iter()
            .map(|s| format!("{}\t{}", s.id, s.display_title()))
            .collect(),
        EntityKind::Client => caches
            .fetch::<Client>(false)
            .await
            .iter()
            .map(|c| format!("{}\t{}", c.id, c.display_name()))
            .collect(),
        EntityKind::PostProduction => caches
            .fetch::<PostProduction>(false)
            .await
            .iter()
            .map(|p| format!("{}\t{}", p.id, p.display_title()))
            .collect(),
    }
}

pub async fn list(options: &AppOptions, kind: &str) -> Result<()> {
    let kind = EntityKind::parse(kind).ok_or_else(|| {
        miette::miette!(
            "unknown kind '{}': expected projects, videos, scripts, clients or post-production",
            kind
        )
    })?;
    let app = App::start(options).await?;
    for line in entity_lines(&app.studio, kind).await {
        println!("{}", line);
    }
    app.shutdown().await;
    Ok(())
}

pub async fn upload(
    cloud: &str,
    preset: &str,
    path: &Path,
    folder: Option<String>,
) -> Result<()> {
    let contents = tokio::fs::read(path)
        .await
        .map_err(|e| miette::miette!("failed to read {}: {}", path.display(), e))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload")
        .to_string();

    let client = MediaClient::new(cloud, preset);
    let options = UploadOptions {
        folder,
        on_progress: Some(Arc::new(|pct| eprint!("\ruploading... {:>3}%", pct))),
    };
    let media = client
        .upload(&file_name, contents, options)
        .await
        .map_err(|e| miette::miette!("upload failed: {}", e))?;
    eprintln!();

    println!("url:       {}", media.url);
    println!("public id: {}", media.public_id);
    println!(
        "size:      {}x{} {} ({} bytes)",
        media.width, media.height, media.format, media.bytes
    );
    println!("thumbnail: {}", derive_thumbnail_url(&media.url, THUMBNAIL_SIZE));
    println!(
        "optimized: {}",
        derive_optimized_url(&media.url, &OptimizeOptions::default())
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cutroom_store::{EntityReference, ReferenceKind};

    fn message(content: &str, references: Vec<EntityReference>) -> ChatMessage {
        ChatMessage {
            id: "m1".to_string(),
            content: content.to_string(),
            sender_id: "u1".to_string(),
            sender_name: "Ali".to_string(),
            mentions: Vec::new(),
            references,
            created_at: None,
        }
    }

    #[test]
    fn resolved_references_render_as_links() {
        let launch = EntityReference {
            kind: ReferenceKind::Project,
            id: "p1".to_string(),
            name: "Launch".to_string(),
        };
        let rendered = render_message(&message(
            "@Sam see #project:Launch and #video:Gone",
            vec![launch],
        ));
        assert_eq!(
            rendered,
            "*@Sam* see [#project:Launch](/projects/p1) and #video:Gone"
        );
    }

    #[test]
    fn multi_word_names_render_whole() {
        let launch = EntityReference {
            kind: ReferenceKind::Project,
            id: "p1".to_string(),
            name: "Spring Launch".to_string(),
        };
        let mut msg = message("@Sam Ortiz see #project:Spring Launch", vec![launch]);
        msg.mentions = vec![cutroom_store::Mention {
            user_id: "u2".to_string(),
            user_name: "Sam Ortiz".to_string(),
        }];
        assert_eq!(
            render_message(&msg),
            "*@Sam Ortiz* see [#project:Spring Launch](/projects/p1)"
        );
    }

    #[test]
    fn pending_messages_show_as_pending() {
        assert_eq!(format_message(&message("hi", Vec::new())), "pending Ali: hi");
    }
}
