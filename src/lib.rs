//! Core streaming engine of a multi-protocol live-media relay.
//!
//! One publication comes in through a wire-protocol parser (external),
//! lands in a per-source actor ([`source::PublishSource`]) that demuxes it
//! into elementary tracks, caches the most recent group of pictures, and
//! fans it out through container transmuxers ([`transmux::TransStream`]) to
//! any number of subscribers ([`sink::Sink`]) -- RTMP, HTTP-FLV, HLS,
//! WebRTC, GB28181 forward or a file recorder.

pub mod cache;
pub mod collections;
pub mod config;
pub mod flv;
pub mod gb28181;
pub mod hls;
pub mod hook;
pub mod media;
pub mod mpegts;
pub mod record;
pub mod registry;
pub mod rtc;
pub mod rtmp;
pub mod sink;
pub mod source;
pub mod transmux;
