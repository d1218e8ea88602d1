pub mod backfill;
pub mod normalize;
pub mod placeholders;

pub use backfill::backfill_time_series;
pub use normalize::normalize;
pub use placeholders::resolve_placeholders;
