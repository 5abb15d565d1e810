//! Strategy activation gate

use crate::regime::{RegimeSnapshot, RegimeState};

/// A strategy may open new positions only in its own regime and outside a
/// cooldown window. Exits never consult the gate.
pub fn is_active(required: RegimeState, snapshot: &RegimeSnapshot, cooling_down: bool) -> bool {
    required == snapshot.current && !cooling_down
}
