//! Zinas - a news aggregator
//!
//! Fetches RSS feeds, classifies articles by topic with an ordered keyword
//! table and serves filtered article lists with per-user ignore, save and
//! view state layered on top.

pub mod classifier;
pub mod config;
pub mod db;
pub mod fetcher;
pub mod preferences;
pub mod query;
pub mod routes;
