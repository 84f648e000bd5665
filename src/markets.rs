use anyhow::Result;
use tracing::info;

use crate::{
    MarketsArgs,
    api::{self, Coinalyze, MarketInfo},
};

/// List tradable markets (or the exchange directory) from discovery.
pub async fn execute(args: &MarketsArgs) -> Result<()> {
    let (key, base) = api::resolve_credentials(args.api_key.as_deref(), args.base_url.as_deref())?;
    let api = Coinalyze::new(&key, &base)?;

    if args.exchanges {
        let exchanges = api.exchanges().await?;
        println!("{}", serde_json::to_string_pretty(&exchanges)?);
        return Ok(());
    }

    let markets = if args.spot {
        api.spot_markets().await?
    } else {
        api.future_markets().await?
    };
    let filter = args.base.as_deref().map(str::to_uppercase);
    let mut shown = 0usize;
    for market in &markets {
        if !matches_base(market, filter.as_deref()) {
            continue;
        }
        println!(
            "{} {} {} {}",
            market.exchange, market.symbol, market.base_asset, market.quote_asset
        );
        shown += 1;
    }
    info!("listed {shown} of {} markets", markets.len());
    Ok(())
}

fn matches_base(market: &MarketInfo, filter: Option<&str>) -> bool {
    match filter {
        Some(f) => market.base_asset.to_uppercase().contains(f),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn market(base: &str) -> MarketInfo {
        MarketInfo {
            symbol: format!("{base}USDT_PERP.A"),
            exchange: "A".into(),
            base_asset: base.into(),
            quote_asset: "USDT".into(),
        }
    }

    #[test]
    fn base_filter_is_substring_and_case_insensitive() {
        assert!(matches_base(&market("BTC"), None));
        assert!(matches_base(&market("BTC"), Some("BTC")));
        assert!(matches_base(&market("WBTC"), Some("BTC")));
        assert!(!matches_base(&market("ETH"), Some("BTC")));
    }
}
