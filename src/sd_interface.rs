// all identifiers share one numeric type so they can be compared and masked
pub type Guid = u64;

/// Position of a node in the engine's node array (equal to its ring position)
pub type NodeIndex = usize;

/// Mock network address ("10.a.b.c")
pub type NodeAddress = String;

/// Simulated time in milliseconds since the start of the run
pub type SimTime = u64;

pub type RequestId = u64;

/// Well-known identifier of the master node in the master-peer variant
pub const DEFAULT_MASTER_GUID: Guid = 0;

/// Largest supported identifier width
pub const MAX_ID_BITS: u32 = 64;

// ============================================================================
// Identifier Space
// ============================================================================

/// Circular identifier space of size 2^bits.
///
/// Built once from configuration and handed to everything that needs ring
/// arithmetic. All results are reduced modulo 2^bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdSpace {
    bits: u32,
    mask: u64,
}

impl IdSpace {
    /// Returns `None` for widths outside `1..=64`
    pub fn new(bits: u32) -> Option<Self> {
        if bits == 0 || bits > MAX_ID_BITS {
            return None;
        }
        let mask = if bits == MAX_ID_BITS {
            u64::MAX
        } else {
            (1u64 << bits) - 1
        };
        Some(Self { bits, mask })
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// Number of identifiers in the space (2^bits)
    pub fn modulus(&self) -> u128 {
        1u128 << self.bits
    }

    pub fn contains(&self, id: Guid) -> bool {
        id & !self.mask == 0
    }

    pub fn wrap(&self, value: u64) -> Guid {
        value & self.mask
    }

    /// Target identifier of finger `i`: `(id + 2^i) mod 2^bits`
    pub fn finger_target(&self, id: Guid, i: u32) -> Guid {
        debug_assert!(i < self.bits);
        self.wrap(id.wrapping_add(1u64 << i))
    }

    /// Clockwise distance from `from` to `to`
    pub fn distance(&self, from: Guid, to: Guid) -> u64 {
        self.wrap(to.wrapping_sub(from))
    }

    /// `x` in the half-open ring interval `(a, b]`. When `a == b` the interval
    /// covers the whole ring.
    pub fn in_open_closed(&self, x: Guid, a: Guid, b: Guid) -> bool {
        if a < b {
            a < x && x <= b
        } else {
            x > a || x <= b
        }
    }

    /// `x` in the open ring interval `(a, b)`. When `a == b` the interval is
    /// the whole ring minus `a`.
    pub fn in_open(&self, x: Guid, a: Guid, b: Guid) -> bool {
        if a < b {
            a < x && x < b
        } else {
            (x > a || x < b) && x != a
        }
    }

    pub fn random_guid<R: rand::Rng>(&self, rng: &mut R) -> Guid {
        self.wrap(rng.gen::<u64>())
    }
}
