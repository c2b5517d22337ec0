#![forbid(unsafe_code)]

//! Specialization cache: maps a structural fingerprint of an operation's
//! operand set to a previously produced compiled artifact.
//!
//! Two hash modes exist per call site. Exact keys record full sizes and
//! strides, so every distinct shape gets its own entry. Coarse keys record
//! one classification code per dimension, so one entry serves a whole
//! broadcast-compatible family of shapes.
//!
//! The full key vector is the map key, compared for equality on every
//! lookup: structurally different operand sets can never conflate, no
//! matter how they hash.

use lm_core::{Primitive, TensorValue};
use rustc_hash::FxHashMap;
use std::sync::Mutex;

// ── Dispatch-key bookkeeping ───────────────────────────────────────

/// Set of dispatch keys a tensor's behavior can depend on, packed into one
/// word for key computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchKeySet(u64);

impl DispatchKeySet {
    pub const EMPTY: Self = Self(0);
    pub const CPU: Self = Self(1 << 0);
    pub const AUTOGRAD: Self = Self(1 << 1);

    #[must_use]
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub fn minus(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Keys implied by the tensor itself.
    #[must_use]
    pub fn of(tensor: &TensorValue) -> Self {
        let mut keys = match tensor.device {
            lm_core::Device::Cpu => Self::CPU,
        };
        if tensor.requires_grad {
            keys = keys.union(Self::AUTOGRAD);
        }
        keys
    }
}

/// Snapshot of the per-call state that changes operator behavior: the
/// ambient grad mode and any included/excluded dispatch-key modifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalState {
    pub grad_enabled: bool,
    pub included: DispatchKeySet,
    pub excluded: DispatchKeySet,
}

impl LocalState {
    #[must_use]
    pub fn new(grad_enabled: bool) -> Self {
        Self {
            grad_enabled,
            included: DispatchKeySet::EMPTY,
            excluded: DispatchKeySet::EMPTY,
        }
    }

    #[must_use]
    pub fn with_modifiers(mut self, included: DispatchKeySet, excluded: DispatchKeySet) -> Self {
        self.included = included;
        self.excluded = excluded;
        self
    }

    #[must_use]
    pub fn apply(&self, keys: DispatchKeySet) -> DispatchKeySet {
        keys.union(self.included).minus(self.excluded)
    }
}

/// Pack (dtype, requires-differentiation) into one key byte. The grad bit is
/// only set while grad mode is ambiently enabled.
#[must_use]
pub fn pack_flags(state: &LocalState, tensor: &TensorValue) -> u8 {
    let requires_grad = state.grad_enabled && tensor.requires_grad;
    u8::from(requires_grad) | (tensor.dtype.code() << 1)
}

// ── Per-dimension classification (coarse mode) ─────────────────────

/// Classification bits for one dimension of a coarse key.
pub mod dim_flags {
    /// A dimension of size 0: implicitly missing / added by broadcasting.
    pub const SIZE_MISSING: i64 = 1 << 0;
    pub const SIZE_ONE: i64 = 1 << 1;
    pub const SIZE_OTHER: i64 = 1 << 2;
    /// Stride 0: broadcast.
    pub const STRIDE_ZERO: i64 = 1 << 3;
    /// Stride 1: packed contiguously.
    pub const STRIDE_ONE: i64 = 1 << 4;
    /// `stride[i] == stride[i+1] * size[i+1]`: forward contiguous.
    pub const STRIDE_CONTIGUOUS: i64 = 1 << 5;
    /// `stride[i] == stride[i-1] * size[i-1]`: reverse contiguous.
    pub const STRIDE_TRANSPOSED_CONTIGUOUS: i64 = 1 << 6;
    /// None of the above: the stride must be treated as an argument.
    pub const STRIDE_AS_ARG: i64 = 1 << 7;
}

/// One classification code per dimension.
#[must_use]
pub fn gen_dim_flags(sizes: &[usize], strides: &[usize]) -> Vec<i64> {
    let ndims = sizes.len();
    let mut flags = vec![0_i64; ndims];
    for dim in 0..ndims {
        let mut flag = if sizes[dim] == 0 {
            dim_flags::SIZE_MISSING
        } else if sizes[dim] == 1 {
            dim_flags::SIZE_ONE
        } else {
            dim_flags::SIZE_OTHER
        };
        if strides[dim] == 0 {
            flag |= dim_flags::STRIDE_ZERO;
        } else if strides[dim] == 1 {
            flag |= dim_flags::STRIDE_ONE;
        } else if dim + 1 < ndims && strides[dim] == strides[dim + 1] * sizes[dim + 1] {
            flag |= dim_flags::STRIDE_CONTIGUOUS;
        } else if dim > 0
            && strides[dim] == strides[dim - 1] * sizes[dim - 1]
            && flags[dim - 1] & dim_flags::STRIDE_CONTIGUOUS == 0
        {
            flag |= dim_flags::STRIDE_TRANSPOSED_CONTIGUOUS;
        } else {
            flag |= dim_flags::STRIDE_AS_ARG;
        }
        flags[dim] = flag;
    }
    flags
}

// ── Key computation ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashMode {
    /// Keys on full shape and stride: one entry per exact layout.
    Exact,
    /// Keys on per-dimension classification codes: one entry per
    /// broadcast-compatible family.
    Coarse,
}

impl HashMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Coarse => "coarse",
        }
    }

    fn discriminator(self) -> i64 {
        match self {
            Self::Coarse => 0,
            Self::Exact => 1,
        }
    }
}

/// Structural fingerprint of one operation call. The encoding is injective
/// over everything dispatch can depend on: per operand a mode discriminator,
/// the packed (dtype, requires-grad) byte, the applied dispatch-key set, the
/// rank, and either full sizes+strides or per-dimension codes; then the
/// operation code and the operand count.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpecializationKey(Vec<i64>);

impl SpecializationKey {
    #[must_use]
    pub fn as_slice(&self) -> &[i64] {
        &self.0
    }
}

fn push_operand_key(key: &mut Vec<i64>, mode: HashMode, state: &LocalState, t: &TensorValue) {
    key.push(mode.discriminator());
    key.push(i64::from(pack_flags(state, t)));
    key.push(state.apply(DispatchKeySet::of(t)).raw() as i64);
    key.push(t.rank() as i64);
    match mode {
        HashMode::Exact => {
            key.extend(t.dims().iter().map(|&d| d as i64));
            key.extend(t.strides().iter().map(|&s| s as i64));
        }
        HashMode::Coarse => {
            key.extend(gen_dim_flags(t.dims(), t.strides()));
        }
    }
}

/// Deterministic key shared by lookup and insert: a prior insert is always
/// found by a structurally identical later call.
#[must_use]
pub fn compute_key(
    primitive: Primitive,
    mode: HashMode,
    state: &LocalState,
    operands: &[TensorValue],
) -> SpecializationKey {
    let mut key = Vec::new();
    for operand in operands {
        push_operand_key(&mut key, mode, state, operand);
    }
    key.push(primitive.code());
    key.push(operands.len() as i64);
    SpecializationKey(key)
}

// ── The cache ──────────────────────────────────────────────────────

/// Exact-match map from specialization key to compiled artifact. Shared
/// mutable state: all access is serialized behind one lock, so concurrent
/// lookups and inserts never observe a torn map.
#[derive(Debug, Default)]
pub struct CompileCache<A> {
    entries: Mutex<FxHashMap<SpecializationKey, A>>,
}

impl<A: Clone> CompileCache<A> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(FxHashMap::default()),
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, FxHashMap<SpecializationKey, A>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    #[must_use]
    pub fn lookup(
        &self,
        primitive: Primitive,
        mode: HashMode,
        state: &LocalState,
        operands: &[TensorValue],
    ) -> Option<A> {
        self.lookup_key(&compute_key(primitive, mode, state, operands))
    }

    #[must_use]
    pub fn lookup_key(&self, key: &SpecializationKey) -> Option<A> {
        self.entries().get(key).cloned()
    }

    pub fn insert(
        &self,
        primitive: Primitive,
        mode: HashMode,
        state: &LocalState,
        operands: &[TensorValue],
        artifact: A,
    ) {
        self.insert_key(compute_key(primitive, mode, state, operands), artifact);
    }

    pub fn insert_key(&self, key: SpecializationKey, artifact: A) {
        self.entries().insert(key, artifact);
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}
