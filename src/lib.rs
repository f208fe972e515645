//! Product extraction for Brazilian e-commerce pages and photos: deterministic
//! scraping first, generative gap filling and image synthesis on top, with
//! token usage priced per batch.

pub mod config;
pub mod cost;
pub mod extraction;
pub mod fetch;
pub mod http;
pub mod imaging;
pub mod llm;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod scrape;
pub mod storage;
pub mod supabase;
pub mod synthesis;
