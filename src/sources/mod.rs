pub mod ergast;
pub mod file_drop;
pub mod http;
pub mod normalize;
pub mod odds_api;
pub mod openf1;
pub mod provider;
pub mod resolver;

use anyhow::{bail, Context, Result};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::db::models::RecordCategory;
use provider::SourceAdapter;
use resolver::SourceChain;

/// Instantiate one named adapter from configuration.
pub fn build_adapter(name: &str, http: &Client, config: &Config) -> Result<Arc<dyn SourceAdapter>> {
    let adapter: Arc<dyn SourceAdapter> = match name {
        "openf1" => Arc::new(openf1::OpenF1::new(http.clone(), &config.openf1_url)),
        "ergast" => Arc::new(ergast::Ergast::new(http.clone(), &config.ergast_url)),
        "odds_api" => {
            let key = config
                .odds_api_key
                .as_deref()
                .context("odds_api needs ODDS_API_KEY")?;
            Arc::new(odds_api::OddsApi::new(
                http.clone(),
                &config.odds_api_url,
                key,
                &config.odds_sport_key,
            ))
        }
        "file_drop" => Arc::new(file_drop::FileDrop::new(&config.file_drop_dir)),
        other => bail!("unknown source adapter '{other}'"),
    };
    Ok(adapter)
}

/// Build the results and odds chains in configured priority order.
pub fn build_chain(config: &Config) -> Result<SourceChain> {
    let timeout = Duration::from_secs(config.source_timeout_secs);
    let http = http::build_client(timeout)?;
    let mut chain = SourceChain::new(config.retry_policy(), timeout);
    for category in [RecordCategory::Result, RecordCategory::Odds] {
        let adapters = config
            .sources_for(category)
            .iter()
            .map(|name| build_adapter(name, &http, config))
            .collect::<Result<Vec<_>>>()?;
        chain = chain.with_chain(category, adapters);
    }
    Ok(chain)
}
