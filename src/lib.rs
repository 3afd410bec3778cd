//! # Open Jukebox
//!
//! Per-guild music playback for Discord.
//!
//! Each guild gets a room with its own queue and voice connection. Tracks are
//! looked up through `yt-dlp`, cached for a while, and streamed straight into
//! the voice connection: Opus sources pass through untouched and everything
//! else is transcoded by `ffmpeg` on the fly.
//!
//! ## Modules
//!
//! - [`audio`]: rooms, queue, stream resolution and the voice transport
//! - [`sources`]: reference parsing and metadata lookups
//! - [`cache`]: TTL metadata cache with in-flight deduplication
//! - [`process`]: supervision of the external tool processes
//! - [`bot`]: Discord slash commands and announcements
//! - [`http`]: optional JSON control surface
//! - [`ui`]: embeds shared by the bot and the notifier

pub mod audio;
pub mod bot;
pub mod cache;
pub mod config;
pub mod error;
pub mod http;
pub mod process;
pub mod sources;
pub mod ui;
