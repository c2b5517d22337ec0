#![forbid(unsafe_code)]

//! The interpreter stack: a strictly nested sequence of active transform
//! layers. Every transform entry point pushes one layer, runs the wrapped
//! function, and pops: the pop is guaranteed on every exit path (including
//! panics) by [`ScopedLayer`].
//!
//! A `LayerStack` belongs to one execution context. Independent top-level
//! invocations each own their own stack; nothing here is process-global.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Identifier of one active transform nesting. Levels are `depth + 1`:
/// strictly increasing while pushing, unique among live layers, and reused
/// only after the layer that held them is popped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Level(pub u32);

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformKind {
    /// Map-over-batch: adds an implicit batch axis of `batch_size`.
    Vectorize { batch_size: usize },
    /// Differentiation bookkeeping; remembers the grad mode that was active
    /// before the layer was pushed so popping can restore it.
    Differentiate { prev_grad_enabled: bool },
}

impl TransformKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vectorize { .. } => "vectorize",
            Self::Differentiate { .. } => "differentiate",
        }
    }

    #[must_use]
    pub fn tag(self) -> KindTag {
        match self {
            Self::Vectorize { .. } => KindTag::Vectorize,
            Self::Differentiate { .. } => KindTag::Differentiate,
        }
    }
}

/// Payload-free discriminant used to state pop expectations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindTag {
    Vectorize,
    Differentiate,
}

impl KindTag {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vectorize => "vectorize",
            Self::Differentiate => "differentiate",
        }
    }
}

/// One active transform layer. The shared `alive` flag is handed to every
/// tracked wrapper created at this level; popping the layer flips it, which
/// invalidates those wrappers without destroying them.
#[derive(Debug, Clone)]
pub struct Layer {
    level: Level,
    kind: TransformKind,
    alive: Rc<Cell<bool>>,
}

impl Layer {
    #[must_use]
    pub fn level(&self) -> Level {
        self.level
    }

    #[must_use]
    pub fn kind(&self) -> TransformKind {
        self.kind
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.get()
    }

    /// Handle shared with wrappers created at this level.
    #[must_use]
    pub fn alive_handle(&self) -> Rc<Cell<bool>> {
        Rc::clone(&self.alive)
    }

    #[must_use]
    pub fn batch_size(&self) -> Option<usize> {
        match self.kind {
            TransformKind::Vectorize { batch_size } => Some(batch_size),
            TransformKind::Differentiate { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackError {
    PopOnEmptyStack {
        expected: KindTag,
    },
    PopKindMismatch {
        expected: KindTag,
        actual: KindTag,
        level: Level,
    },
}

impl std::fmt::Display for StackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PopOnEmptyStack { expected } => {
                write!(
                    f,
                    "attempted to pop a {} layer from an empty interpreter stack",
                    expected.as_str()
                )
            }
            Self::PopKindMismatch {
                expected,
                actual,
                level,
            } => {
                write!(
                    f,
                    "expected to pop a {} layer but {} holds a {} layer",
                    expected.as_str(),
                    level,
                    actual.as_str()
                )
            }
        }
    }
}

impl std::error::Error for StackError {}

#[derive(Debug, Default)]
pub struct LayerStack {
    layers: Vec<Layer>,
}

impl LayerStack {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    #[must_use]
    pub fn current(&self) -> Option<&Layer> {
        self.layers.last()
    }

    #[must_use]
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Push a new layer and allocate its level.
    pub fn push(&mut self, kind: TransformKind) -> Level {
        let level = Level(self.layers.len() as u32 + 1);
        self.layers.push(Layer {
            level,
            kind,
            alive: Rc::new(Cell::new(true)),
        });
        level
    }

    /// Pop the topmost layer, which must be of the expected kind. Popping
    /// retires the layer's level and kills the wrappers created at it. An
    /// empty stack or a kind mismatch is a contract violation and fatal to
    /// the current call.
    pub fn pop(&mut self, expected: KindTag) -> Result<Layer, StackError> {
        let top = self
            .layers
            .last()
            .ok_or(StackError::PopOnEmptyStack { expected })?;
        if top.kind.tag() != expected {
            return Err(StackError::PopKindMismatch {
                expected,
                actual: top.kind.tag(),
                level: top.level,
            });
        }
        let layer = self.layers.pop().expect("top layer was just inspected");
        layer.alive.set(false);
        Ok(layer)
    }
}

/// Shared handle to one execution context's stack.
pub type SharedStack = Rc<RefCell<LayerStack>>;

#[must_use]
pub fn shared_stack() -> SharedStack {
    Rc::new(RefCell::new(LayerStack::new()))
}

/// RAII layer scope: pushes on construction, pops on drop. The drop runs on
/// every exit path, so a wrapped function that errors or panics cannot leak
/// its layer. Finding a different layer on top at drop time means the
/// interpreter state is corrupted, which is a programming-contract violation
/// and panics (unless already unwinding from another panic).
#[derive(Debug)]
pub struct ScopedLayer {
    stack: SharedStack,
    level: Level,
    tag: KindTag,
}

impl ScopedLayer {
    pub fn enter(stack: &SharedStack, kind: TransformKind) -> Self {
        let level = stack.borrow_mut().push(kind);
        Self {
            stack: Rc::clone(stack),
            level,
            tag: kind.tag(),
        }
    }

    #[must_use]
    pub fn level(&self) -> Level {
        self.level
    }

    /// The layer this scope pushed, as currently on the stack.
    #[must_use]
    pub fn layer(&self) -> Layer {
        let stack = self.stack.borrow();
        let layer = stack.current().expect("scoped layer is on the stack");
        debug_assert_eq!(layer.level(), self.level);
        layer.clone()
    }
}

impl Drop for ScopedLayer {
    fn drop(&mut self) {
        let result = self.stack.borrow_mut().pop(self.tag);
        match result {
            Ok(layer) if layer.level() == self.level => {}
            Ok(layer) => {
                if !std::thread::panicking() {
                    panic!(
                        "interpreter stack corrupted: scoped {} released {} instead of {}",
                        self.tag.as_str(),
                        layer.level(),
                        self.level
                    );
                }
            }
            Err(err) => {
                if !std::thread::panicking() {
                    panic!("interpreter stack corrupted: {err}");
                }
            }
        }
    }
}
