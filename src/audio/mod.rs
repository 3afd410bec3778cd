//! # Audio Module
//!
//! Per-guild playback for Open Jukebox.
//!
//! ## Architecture
//!
//! Playback is split into four layers, each usable on its own:
//!
//! ### [`probe`] - Stream Sniffing
//! - Reads the first bytes of an external process' stdout
//! - Accepts only Opus in Ogg or WebM containers
//!
//! ### [`resolver`] - Two-Stage Resolution
//! - Stage 1 asks the extractor for a native Opus stream
//! - Stage 2 pipes any audio through the transcoder into Ogg/Opus
//! - Every process belongs to a playback attempt and dies with it
//!
//! ### [`queue`] - Track Queue
//! - Bounded FIFO with "play next" insertion at the front
//!
//! ### [`player`] - Rooms
//! - One actor per guild owns its queue, current track and voice state
//! - [`PlaybackManager`] routes commands to the right room
//!
//! [`transport`] is the seam between rooms and the voice connection; the
//! songbird implementation lives there too.
//!
//! ## Audio Format
//!
//! - **Sample Rate**: 48kHz (Discord standard)
//! - **Channels**: Stereo
//! - **Encoding**: Opus, passed through when possible and transcoded otherwise
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use open_jukebox::audio::{PlaybackManager, Requester};
//! use serenity::all::{ChannelId, GuildId, UserId};
//!
//! # async fn example(manager: &PlaybackManager) -> anyhow::Result<()> {
//! let guild_id = GuildId::new(123456789);
//! let requester = Requester {
//!     user_id: UserId::new(42),
//!     voice_channel: Some(ChannelId::new(7)),
//!     text_channel: None,
//! };
//!
//! manager.enqueue(guild_id, "never gonna give you up", requester, false).await?;
//! manager.pause(guild_id).await?;
//! manager.resume(guild_id).await?;
//! manager.skip(guild_id).await?;
//! # Ok(())
//! # }
//! ```

pub mod player;
pub mod probe;
pub mod queue;
pub mod resolver;
pub mod transport;

pub use player::{
    PlaybackManager, PlaybackNotifier, PlaybackServices, PlaybackStatus, Requester, RoomContext,
    RoomSnapshot,
};
pub use resolver::{ResolvedStream, StreamCommands, StreamResolver};
pub use transport::{SongbirdTransport, VoiceTransport};
