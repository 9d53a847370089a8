use serde::Serialize;

pub const DEFAULT_RESERVE_TOKENS_FLOOR: u64 = 20_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveFloorResult {
    pub reserve_tokens: u64,
    pub did_override: bool,
}

/// Raises a configured reserve to `floor`; never lowers it.
pub fn ensure_reserve_tokens_floor(configured: u64, floor: u64) -> ReserveFloorResult {
    if configured >= floor {
        return ReserveFloorResult {
            reserve_tokens: configured,
            did_override: false,
        };
    }
    ReserveFloorResult {
        reserve_tokens: floor,
        did_override: true,
    }
}
