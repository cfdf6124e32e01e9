//! CLI command runners.
//!
//! Each `run_*` function backs one `rask` subcommand. Answers go to stdout;
//! progress, tool activity and errors go to stderr so the answer can be
//! piped on its own.

use anyhow::{bail, Context, Result};
use futures_util::StreamExt;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::ask::{AskRequest, Asker};
use crate::cache::ResourceCache;
use crate::client::RemoteClient;
use crate::collection::{resource_names, CollectionAssembler};
use crate::config::{self, Config};
use crate::error::ResourceError;
use crate::models::{Chunk, ResourceDefinition};
use crate::opencode::OpenCodeBackend;
use crate::sse::{Transcript, WireEvent};
use crate::threads::ThreadStore;
use crate::{db, migrate};

/// Writes the starter config if needed, then creates the storage
/// directories and the thread database.
pub async fn run_init(config_path: &Path) -> Result<()> {
    if config::write_starter(config_path)? {
        println!("Wrote starter config to {}", config_path.display());
    }
    let cfg = config::load_config(config_path)?;
    for dir in [&cfg.storage.resources_dir, &cfg.storage.collections_dir] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    migrate::run_migrations(&cfg).await?;
    println!("Database initialized successfully.");
    Ok(())
}

pub fn list_resources(cfg: &Config) -> Result<()> {
    if cfg.resources.is_empty() {
        println!("No resources configured.");
        return Ok(());
    }
    println!("{:<20} {:<6} {:<48} NOTES", "NAME", "TYPE", "SOURCE");
    for resource in &cfg.resources {
        println!(
            "{:<20} {:<6} {:<48} {}",
            resource.name(),
            resource.kind(),
            resource.origin(),
            resource.notes()
        );
    }
    Ok(())
}

/// Clones or refreshes each named resource and prints where it lives.
pub async fn run_ensure(cfg: &Config, names: &[String]) -> Result<()> {
    let cache = ResourceCache::new(&cfg.storage.resources_dir);
    let names = resource_names(names);
    if names.is_empty() {
        bail!("at least one resource is required");
    }

    let mut defs = Vec::with_capacity(names.len());
    for name in &names {
        let def = cfg
            .resource(name)
            .ok_or_else(|| ResourceError::NotConfigured(name.clone()))?;
        defs.push(def);
    }

    let cached = futures_util::future::try_join_all(defs.into_iter().map(|d| cache.ensure(d))).await?;
    for resource in cached {
        println!("{:<20} {}", resource.name, resource.path.display());
    }
    Ok(())
}

/// Drops cached clones so the next use clones them fresh.
pub async fn run_remove(cfg: &Config, names: &[String]) -> Result<()> {
    let cache = ResourceCache::new(&cfg.storage.resources_dir);
    for name in resource_names(names) {
        if let Some(ResourceDefinition::Local { path, .. }) = cfg.resource(&name) {
            println!("{} is a local resource ({}), nothing to remove", name, path.display());
            continue;
        }
        if cache.remove(&name).await? {
            println!("Removed {}", name);
        } else {
            println!("{} is not cached", name);
        }
    }
    Ok(())
}

pub async fn run_collection(cfg: &Config, names: &[String]) -> Result<()> {
    let collection = CollectionAssembler::from_config(cfg).ensure(names).await?;
    println!("key:  {}", collection.key);
    println!("path: {}", collection.path.display());
    if !collection.notes.is_empty() {
        println!("notes:");
        for line in collection.notes.lines() {
            println!("  {}", line);
        }
    }
    Ok(())
}

/// Asks a question in-process, spawning the agent locally.
///
/// Ctrl-C cancels the question; it is still recorded, as canceled.
pub async fn run_ask(cfg: &Config, request: AskRequest) -> Result<()> {
    let pool = db::connect(cfg).await?;
    migrate::migrate(&pool).await?;
    let backend = OpenCodeBackend::new(cfg.agent.clone())?;
    let asker = Asker::new(
        cfg.agent.clone(),
        Arc::new(CollectionAssembler::from_config(cfg)),
        Arc::new(backend),
        ThreadStore::new(pool.clone()),
    );

    let cancel = CancellationToken::new();
    let interrupt = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        }
    });

    let mut printer = Printer::new(io::stdout(), io::stderr());
    let result = asker
        .ask(request, cancel, |event| {
            if let Err(err) = printer.render(&event) {
                tracing::warn!(error = %err, "failed to write output");
            }
        })
        .await;
    interrupt.abort();
    pool.close().await;

    result.map(|_| ()).map_err(Into::into)
}

/// Asks a question through a running `rask serve`.
///
/// Ctrl-C drops the connection, which cancels the question server-side.
pub async fn run_ask_remote(server: &str, request: AskRequest) -> Result<()> {
    let client = RemoteClient::new(server)?;
    let mut events = client.ask_stream(&request).await?;
    let mut printer = Printer::new(io::stdout(), io::stderr());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                drop(events);
                printer.finish()?;
                eprintln!("canceled");
                return Ok(());
            }
            next = events.next() => match next {
                Some(event) => printer.render(&event?)?,
                None => break,
            },
        }
    }

    if let Some(message) = printer.transcript().error() {
        bail!("{}", message);
    }
    if printer.transcript().status().is_none() {
        bail!("stream ended before the question finished");
    }
    Ok(())
}

pub async fn run_threads_list(cfg: &Config) -> Result<()> {
    let store = open_store(cfg).await?;
    let threads = store.list_threads().await?;
    if threads.is_empty() {
        println!("No threads yet.");
        return Ok(());
    }
    println!("{:<36} {:>3} {:<16} {:<24} TITLE", "ID", "Q", "UPDATED", "RESOURCES");
    for thread in threads {
        println!(
            "{:<36} {:>3} {:<16} {:<24} {}",
            thread.id,
            thread.question_count,
            format_millis(thread.updated_at),
            thread.resources.join("+"),
            truncate(thread.title.as_deref().unwrap_or(""), 60)
        );
    }
    Ok(())
}

pub async fn run_threads_show(cfg: &Config, id: &str) -> Result<()> {
    let store = open_store(cfg).await?;
    let Some(thread) = store.get_thread(id).await? else {
        bail!("thread not found: {}", id);
    };

    println!("thread {}", thread.id);
    println!("resources: {}", thread.resources().join(", "));
    for question in &thread.questions {
        println!();
        println!(
            "#{} [{}] {}/{} {}",
            question.order,
            question.status.as_str(),
            question.provider,
            question.model,
            format_millis(question.created_at)
        );
        println!("> {}", question.prompt);
        println!();
        println!("{}", question.answer);
    }
    Ok(())
}

pub async fn run_threads_delete(cfg: &Config, id: &str) -> Result<()> {
    let store = open_store(cfg).await?;
    if !store.delete_thread(id).await? {
        bail!("thread not found: {}", id);
    }
    println!("Deleted thread {}", id);
    Ok(())
}

async fn open_store(cfg: &Config) -> Result<ThreadStore> {
    let pool = db::connect(cfg).await?;
    migrate::migrate(&pool).await?;
    Ok(ThreadStore::new(pool))
}

fn format_millis(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| millis.to_string())
}

fn truncate(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or("");
    if line.chars().count() <= max {
        return line.to_string();
    }
    let cut: String = line.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", cut)
}

/// Renders wire events for a terminal.
///
/// Text chunks stream to `out` as they grow; everything else is a one-line
/// note on `err`. A `reset` update reprints the chunk's whole text on a
/// fresh line.
pub struct Printer<O: Write, E: Write> {
    out: O,
    err: E,
    transcript: Transcript,
    /// Text chunk most recently written to `out`.
    current: Option<String>,
}

impl<O: Write, E: Write> Printer<O, E> {
    pub fn new(out: O, err: E) -> Self {
        Self {
            out,
            err,
            transcript: Transcript::new(),
            current: None,
        }
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn render(&mut self, event: &WireEvent) -> io::Result<()> {
        self.transcript.apply(event);
        match event {
            WireEvent::Meta {
                collection_key,
                provider,
                model,
                thread_id,
                ..
            } => writeln!(
                self.err,
                "[{}] asking {}/{} (thread {})",
                collection_key, provider, model, thread_id
            )?,
            WireEvent::Add { chunk } => match chunk {
                Chunk::Text { id, text } => {
                    switch_to(&mut self.current, &mut self.out, id)?;
                    write!(self.out, "{}", text)?;
                    self.out.flush()?;
                }
                Chunk::Reasoning { .. } => writeln!(self.err, "[thinking]")?,
                Chunk::Tool {
                    tool_name, state, ..
                } => writeln!(self.err, "[tool] {} ({:?})", tool_name, state)?,
                Chunk::File { path, .. } => writeln!(self.err, "[file] {}", path)?,
            },
            WireEvent::Update {
                id,
                delta,
                reset,
                state,
            } => match self.transcript.get(id) {
                Some(Chunk::Text { text, .. }) => {
                    if *reset {
                        self.current = None;
                        writeln!(self.out)?;
                        switch_to(&mut self.current, &mut self.out, id)?;
                        write!(self.out, "{}", text)?;
                    } else if let Some(delta) = delta {
                        switch_to(&mut self.current, &mut self.out, id)?;
                        write!(self.out, "{}", delta)?;
                    }
                    self.out.flush()?;
                }
                Some(Chunk::Tool { tool_name, .. }) => {
                    if let Some(state) = state {
                        writeln!(self.err, "[tool] {} ({:?})", tool_name, state)?;
                    }
                }
                _ => {}
            },
            WireEvent::Done {
                status,
                question_id,
                ..
            } => {
                self.finish()?;
                writeln!(
                    self.err,
                    "[{}] question {}",
                    status.as_str(),
                    question_id.as_deref().unwrap_or("-")
                )?;
            }
            WireEvent::Error { message } => {
                self.finish()?;
                writeln!(self.err, "error: {}", message)?;
            }
        }
        Ok(())
    }

    /// Ends the current line of answer text, if any.
    pub fn finish(&mut self) -> io::Result<()> {
        if self.current.take().is_some() {
            writeln!(self.out)?;
            self.out.flush()?;
        }
        Ok(())
    }
}

/// Makes `id` the chunk being written, separating it from the previous one.
fn switch_to<W: Write>(current: &mut Option<String>, out: &mut W, id: &str) -> io::Result<()> {
    match current {
        Some(existing) if existing == id => {}
        Some(_) => {
            write!(out, "\n\n")?;
            *current = Some(id.to_string());
        }
        None => *current = Some(id.to_string()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{QuestionStatus, ToolState};

    fn render(events: &[WireEvent]) -> (String, String) {
        let mut out = Vec::new();
        let mut err = Vec::new();
        {
            let mut printer = Printer::new(&mut out, &mut err);
            for event in events {
                printer.render(event).unwrap();
            }
        }
        (
            String::from_utf8(out).unwrap(),
            String::from_utf8(err).unwrap(),
        )
    }

    fn add_text(id: &str, text: &str) -> WireEvent {
        WireEvent::Add {
            chunk: Chunk::Text {
                id: id.into(),
                text: text.into(),
            },
        }
    }

    fn delta(id: &str, delta: &str, reset: bool) -> WireEvent {
        WireEvent::Update {
            id: id.into(),
            delta: Some(delta.into()),
            reset,
            state: None,
        }
    }

    fn done() -> WireEvent {
        WireEvent::Done {
            answer: String::new(),
            status: QuestionStatus::Completed,
            question_id: Some("q1".into()),
        }
    }

    #[test]
    fn text_streams_to_stdout() {
        let (out, err) = render(&[add_text("p1", "Hel"), delta("p1", "lo", false), done()]);
        assert_eq!(out, "Hello\n");
        assert!(err.contains("[completed] question q1"));
    }

    #[test]
    fn separate_parts_get_a_blank_line() {
        let (out, _) = render(&[add_text("p1", "One"), add_text("p2", "Two"), done()]);
        assert_eq!(out, "One\n\nTwo\n");
    }

    #[test]
    fn reset_reprints_whole_text() {
        let (out, _) = render(&[add_text("p1", "Hello"), delta("p1", "Help", true), done()]);
        assert_eq!(out, "Hello\nHelp\n");
    }

    #[test]
    fn reset_of_earlier_part_reprints_it_after_the_newer_one() {
        let (out, _) = render(&[
            add_text("p1", "First"),
            add_text("p2", "Second"),
            delta("p1", "Fixed", true),
            delta("p1", "!", false),
            done(),
        ]);
        assert_eq!(out, "First\n\nSecond\nFixed!\n");
    }

    #[test]
    fn tools_go_to_stderr() {
        let (out, err) = render(&[
            WireEvent::Add {
                chunk: Chunk::Tool {
                    id: "c1".into(),
                    tool_name: "grep".into(),
                    state: ToolState::Running,
                },
            },
            WireEvent::Update {
                id: "c1".into(),
                delta: None,
                reset: false,
                state: Some(ToolState::Completed),
            },
        ]);
        assert!(out.is_empty());
        assert_eq!(err, "[tool] grep (Running)\n[tool] grep (Completed)\n");
    }

    #[test]
    fn truncate_keeps_first_line() {
        assert_eq!(truncate("short\nsecond", 10), "short");
        assert_eq!(truncate("abcdefghijkl", 8), "abcde...");
    }
}
