// Metric names for the `metrics` facade. The library records; embedding
// applications choose and install the exporter.

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: reservations committed or amended. Labels: forced.
pub const RESERVATIONS_COMMITTED_TOTAL: &str = "roomledger_reservations_committed_total";

/// Counter: conflicts committed anyway because the caller passed `force`. Labels: kind.
pub const OVERRIDES_FORCED_TOTAL: &str = "roomledger_overrides_forced_total";

/// Counter: bookings rejected with a recoverable conflict. Labels: kind.
pub const CONFLICTS_REJECTED_TOTAL: &str = "roomledger_conflicts_rejected_total";

/// Counter: guests bound to a physical room. Labels: tier.
pub const CHECK_INS_TOTAL: &str = "roomledger_check_ins_total";

/// Counter: in-house room changes. Labels: reason.
pub const ROOM_CHANGES_TOTAL: &str = "roomledger_room_changes_total";

/// Histogram: availability query latency in seconds. Labels: query.
pub const AVAILABILITY_QUERY_DURATION_SECONDS: &str =
    "roomledger_availability_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: number of hotels with a loaded engine.
pub const HOTELS_ACTIVE: &str = "roomledger_hotels_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "roomledger_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "roomledger_wal_flush_batch_size";
