use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use skyscout_core::{SearchCriteria, SearchParams, SortMode};
use skyscout_search::{SearchConfig, SearchPipeline};

#[derive(Debug, Parser)]
#[command(name = "skyscout-cli")]
#[command(about = "SkyScout command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// One-off search against the configured provider chain.
    Search {
        #[arg(long)]
        origin: String,
        #[arg(long)]
        destination: String,
        /// Departure date, YYYY-MM-DD.
        #[arg(long)]
        date: NaiveDate,
        #[arg(long, default_value = "best")]
        sort: SortMode,
        #[arg(long)]
        max_results: Option<usize>,
    },
    /// Rebuild the promotional deal set and print it.
    Deals,
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Search {
            origin,
            destination,
            date,
            sort,
            max_results,
        } => {
            let config = SearchConfig::from_env();
            let pipeline = SearchPipeline::from_config(&config).await?;
            let params = SearchParams {
                origin: origin.to_ascii_uppercase(),
                destination: destination.to_ascii_uppercase(),
                departure_date: date,
                return_date: None,
                adults: 1,
                max_results,
            };
            let criteria = SearchCriteria::for_route(&params.origin, &params.destination, date);

            let outcome = pipeline.run_search(&params, &criteria, sort).await;
            println!(
                "search complete: run_id={} provider={} offers={}",
                outcome.summary.run_id,
                outcome.summary.provider.as_deref().unwrap_or("mock"),
                outcome.summary.offer_count
            );
            for offer in &outcome.offers {
                let stops = match offer.stops {
                    0 => "direct".to_string(),
                    n => format!("{n} stop(s) via {}", offer.layover_airport.as_deref().unwrap_or("?")),
                };
                println!(
                    "  #{} {} {} {}-{} ({}) {} {:.2} {}",
                    offer.id,
                    offer.airline,
                    offer.flight_number,
                    offer.departure_time,
                    offer.arrival_time,
                    offer.duration,
                    stops,
                    offer.price_major(),
                    offer.currency
                );
            }
        }
        Commands::Deals => {
            let config = SearchConfig::from_env();
            let pipeline = SearchPipeline::from_config(&config).await?;
            let count = pipeline.refresh_deals().await?;
            println!("deal refresh complete: {count} deals");
            for deal in pipeline.deals().all().await {
                println!(
                    "  {} {} {:.2} {} (-{}%)",
                    deal.destination,
                    deal.airline,
                    deal.price as f64 / 100.0,
                    deal.currency,
                    deal.discount_percent
                );
            }
        }
        Commands::Serve => skyscout_web::serve_from_env().await?,
    }

    Ok(())
}
