pub mod clock;
pub mod ids;

pub use clock::{now_iso, now_ms, now_s};
pub use ids::{id_string, new_id};
