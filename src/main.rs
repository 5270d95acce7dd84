use std::path::PathBuf;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use tracing::info;
use ulid::Ulid;

use roomledger::directory::{InMemoryDirectory, RoomDirectory};
use roomledger::engine::Engine;
use roomledger::tenant::{DirectoryFactory, HotelRegistry};

/// One line of the nightly report.
#[derive(Serialize)]
struct RoomTypeReport<'a> {
    hotel: &'a str,
    night: NaiveDate,
    room_type_id: Ulid,
    name: Option<String>,
    total_units: u32,
    free_units: u32,
    active_claims: usize,
    sold_out: bool,
}

async fn report_hotel(
    hotel: &str,
    engine: &Engine,
    night: NaiveDate,
) -> Result<(), Box<dyn std::error::Error>> {
    let next = night.succ_opt().ok_or("report date out of range")?;
    for room_type in engine.list_room_types().await {
        let free = engine.nightly_availability(room_type.id, night, next).await?;
        let free_units = free.first().map_or(room_type.qty, |n| n.free_units);
        let active_claims = engine.active_claims(room_type.id).await?.len();
        let line = RoomTypeReport {
            hotel,
            night,
            room_type_id: room_type.id,
            name: room_type.name,
            total_units: room_type.qty,
            free_units,
            active_claims,
            sold_out: free_units == 0,
        };
        println!("{}", serde_json::to_string(&line)?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let data_dir = std::env::var("ROOMLEDGER_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let compact_threshold: u64 = std::env::var("ROOMLEDGER_COMPACT_THRESHOLD")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1000);
    let night = match std::env::var("ROOMLEDGER_REPORT_DATE") {
        Ok(s) => NaiveDate::parse_from_str(&s, "%Y-%m-%d")?,
        Err(_) => Utc::now().date_naive(),
    };

    std::fs::create_dir_all(&data_dir)?;

    // The report only reads claim state; physical rooms are not needed.
    let directories: DirectoryFactory =
        Arc::new(|_: &str| Arc::new(InMemoryDirectory::new()) as Arc<dyn RoomDirectory>);
    let registry = HotelRegistry::new(PathBuf::from(&data_dir), compact_threshold, directories);

    let mut hotels: Vec<String> = std::fs::read_dir(&data_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "wal"))
        .filter_map(|path| path.file_stem().and_then(|s| s.to_str()).map(String::from))
        .collect();
    hotels.sort();

    info!("roomledger report for {night}");
    info!("  data_dir: {data_dir}");
    info!("  hotels: {}", hotels.len());

    for hotel in &hotels {
        let engine = registry.get_or_create(hotel)?;
        report_hotel(hotel, &engine, night).await?;
    }

    // Nothing is appended here, so the threshold applies to the replayed log length.
    for hotel in &hotels {
        if let Some(engine) = registry.get(hotel)
            && engine.replayed_events() as u64 >= compact_threshold
        {
            engine.compact_wal().await?;
            info!("compacted {hotel} ({} events replayed)", engine.replayed_events());
        }
    }

    Ok(())
}
