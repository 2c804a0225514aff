//! Monthly ROI batch runner.
//!
//! Usage: `upline-roi [year month]`. Without arguments the current calendar
//! month is used.

use chrono::{Datelike, Utc};
use tracing::info;

use upline::activation::build_services;
use upline::commission::RoiPeriod;
use upline::config::Config;
use upline::telemetry::init_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None)?;
    let services = build_services(&config).await?;

    let mut args = std::env::args().skip(1);
    let (year, month) = match (args.next(), args.next()) {
        (Some(year), Some(month)) => (year.parse()?, month.parse()?),
        _ => {
            let now = Utc::now();
            (now.year(), now.month())
        }
    };

    let report = services
        .activation
        .run_monthly_roi(RoiPeriod { year, month })
        .await?;
    info!(
        year,
        month,
        members = report.members_paid,
        total = report.total_minor,
        "roi batch finished"
    );
    Ok(())
}
