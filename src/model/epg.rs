use serde::{Deserialize, Serialize};

/// One endpoint group, keyed by dn. `bd` is resolved through the
/// BD-linking relation objects after the base rows are inserted; rows
/// whose link never arrives keep `bd = 0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Epg {
    pub fabric: String,
    /// Dn of the epg.
    pub name: String,
    #[serde(default)]
    pub bd: u32,
    pub ts: f64,
}
