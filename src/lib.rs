//! # repo-ask
//!
//! Answer questions about git repositories and local directories by
//! running a coding agent over a local copy of them.
//!
//! A question names one or more configured *resources*. Each resource is
//! kept cached on disk (a sparse git clone, or a local directory used in
//! place). The resources a question needs are joined into a *collection*,
//! a directory of symlinks that becomes the agent's working directory. The
//! agent's event stream is reduced into ordered chunks, streamed to the
//! caller, and the finished question is recorded in a *thread*.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────┐   ┌─────────────┐   ┌──────────┐
//! │  Cache   │──▶│ Collection │──▶│ Agent (HTTP) │──▶│ Reducer  │
//! │ git/local│   │  symlinks  │   │  opencode    │   │  chunks  │
//! └──────────┘   └────────────┘   └─────────────┘   └────┬─────┘
//!                                                         │
//!                          ┌──────────────┬───────────────┤
//!                          ▼              ▼               ▼
//!                    ┌──────────┐   ┌──────────┐   ┌──────────┐
//!                    │   CLI    │   │ SSE/HTTP │   │ Threads  │
//!                    │  (rask)  │   │  server  │   │ (SQLite) │
//!                    └──────────┘   └──────────┘   └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration, layering |
//! | [`models`] | Core data types |
//! | [`validate`] | Resource name, branch, URL and path checks |
//! | [`git`] | `git` subprocess invocation |
//! | [`cache`] | Resource cache (clone, refresh, per-name locking) |
//! | [`collection`] | Collection assembly |
//! | [`agent`] | Agent backend and session traits, scripted backend |
//! | [`opencode`] | `opencode serve` backend |
//! | [`events`] | Raw agent events |
//! | [`stream`] | Stream reducer |
//! | [`sse`] | Server-sent event codec and transcript |
//! | [`threads`] | Thread store |
//! | [`ask`] | The ask pipeline |
//! | [`server`] | HTTP server |
//! | [`client`] | Client for a remote server |
//! | [`commands`] | CLI command runners |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`error`] | Typed errors |

pub mod agent;
pub mod ask;
pub mod cache;
pub mod client;
pub mod collection;
pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod git;
pub mod migrate;
pub mod models;
pub mod opencode;
pub mod server;
pub mod sse;
pub mod stream;
pub mod threads;
pub mod validate;
