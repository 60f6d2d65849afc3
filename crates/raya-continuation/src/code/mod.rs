//! Code metadata consumed by the frame walkers
//!
//! The [`CodeCache`] answers the two questions every walk asks about a pc:
//! is it interpreter code, and if not, which [`CodeBlob`] (frame size, stack
//! argument size, reference map) does it belong to. Interpreted frames are
//! described by the [`Method`] named in their method slot.
//!
//! # Code Address Space
//!
//! ```text
//! INTERPRETER_CODE_BEGIN .. INTERPRETER_CODE_END   interpreter, pc = begin + bci
//! RETURN_BARRIER_PC                                return barrier stub
//! ENTRY_STUB_BEGIN ..                              continuation entry stubs
//! CODE_HEAP_BEGIN ..                               compiled blobs, CODE_BLOB_SPAN each
//! ```

mod oop_map;

pub use oop_map::{InterpreterOopMask, OopMap, OopSlot, VMReg};

use rustc_hash::FxHashMap;

use crate::defaults::{
    CHUNK_SIZE_ALIGNMENT_WORDS, CODE_BLOB_SPAN, CODE_HEAP_BEGIN, ENTRY_STUB_BEGIN, ENTRY_STUB_SIZE,
    INTERPRETER_CODE_BEGIN, INTERPRETER_CODE_END, RETURN_BARRIER_PC,
};
use crate::{ContinuationError, ContinuationResult, Pc, Word};

/// Words of link + return pc every frame size includes.
const FRAME_METADATA_WORDS: usize = 2;

/// Index of a registered code blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobId(pub u32);

/// Id of a registered method, as stored in an interpreted frame's method slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub u32);

impl MethodId {
    /// Decode a method slot.
    pub fn from_word(word: Word) -> ContinuationResult<Self> {
        u32::try_from(word)
            .map(MethodId)
            .map_err(|_| ContinuationError::invariant(format!("bad method slot {word:#x}")))
    }

    /// Encode for a method slot.
    #[inline]
    pub fn to_word(self) -> Word {
        self.0 as Word
    }
}

/// A compiled method's code
#[derive(Debug, Clone)]
pub struct CodeBlob {
    /// Name for diagnostics
    pub name: String,

    /// Frame size in words, including link and return pc
    pub frame_size: usize,

    /// Words of stack arguments passed by the caller
    pub stack_argsize: usize,

    /// References live at call sites
    pub oop_map: OopMap,

    /// Callee-saved registers spilled by this frame, with their offset from
    /// the unextended sp
    pub saved_registers: Vec<(VMReg, usize)>,

    /// First pc, assigned on registration
    begin: Pc,
}

impl CodeBlob {
    /// Create a blob without references or saved registers
    pub fn new(name: impl Into<String>, frame_size: usize, stack_argsize: usize) -> Self {
        Self {
            name: name.into(),
            frame_size,
            stack_argsize,
            oop_map: OopMap::none(),
            saved_registers: Vec::new(),
            begin: 0,
        }
    }

    /// Set the reference map
    pub fn with_oop_map(mut self, oop_map: OopMap) -> Self {
        self.oop_map = oop_map;
        self
    }

    /// Record a callee-saved register spill slot
    pub fn with_saved_register(mut self, reg: VMReg, sp_offset: usize) -> Self {
        self.saved_registers.push((reg, sp_offset));
        self
    }

    /// First pc of the blob
    #[inline]
    pub fn begin(&self) -> Pc {
        self.begin
    }

    /// Pc at `offset` bytes into the blob
    #[inline]
    pub fn pc_at(&self, offset: Pc) -> Pc {
        self.begin + offset
    }

    /// Whether `pc` belongs to this blob
    #[inline]
    pub fn contains(&self, pc: Pc) -> bool {
        (self.begin..self.begin + CODE_BLOB_SPAN).contains(&pc)
    }

    fn validate(&self) -> ContinuationResult<()> {
        if self.frame_size < FRAME_METADATA_WORDS || self.frame_size % CHUNK_SIZE_ALIGNMENT_WORDS != 0 {
            return Err(ContinuationError::invariant(format!(
                "blob {}: frame size {} is not an aligned frame",
                self.name, self.frame_size
            )));
        }
        self.oop_map
            .validate(self.frame_size, self.stack_argsize, FRAME_METADATA_WORDS)?;
        let body = self.frame_size - FRAME_METADATA_WORDS;
        if let Some((reg, off)) = self.saved_registers.iter().find(|(_, off)| *off >= body) {
            return Err(ContinuationError::invariant(format!(
                "blob {}: {reg} spilled at {off}, outside the frame body",
                self.name
            )));
        }
        Ok(())
    }
}

/// An interpreted method
#[derive(Debug, Clone)]
pub struct Method {
    /// Name for diagnostics
    pub name: String,

    /// Parameter words, passed in the caller's top operand slots
    pub size_of_parameters: usize,

    /// Local words including parameters
    pub max_locals: usize,

    /// Reference masks by bytecode index
    oop_masks: FxHashMap<u32, InterpreterOopMask>,
}

impl Method {
    /// Create a method without references
    pub fn new(name: impl Into<String>, size_of_parameters: usize, max_locals: usize) -> Self {
        Self {
            name: name.into(),
            size_of_parameters,
            max_locals: max_locals.max(size_of_parameters),
            oop_masks: FxHashMap::default(),
        }
    }

    /// Attach the reference mask for `bci`
    pub fn with_oop_mask(mut self, bci: u32, mask: InterpreterOopMask) -> Self {
        self.oop_masks.insert(bci, mask);
        self
    }

    /// Reference mask at `bci`, if any references are live there
    pub fn oop_mask(&self, bci: u32) -> Option<&InterpreterOopMask> {
        self.oop_masks.get(&bci)
    }
}

/// Registry of compiled blobs and interpreted methods
#[derive(Debug)]
pub struct CodeCache {
    blobs: Vec<CodeBlob>,
    blob_names: FxHashMap<String, BlobId>,
    methods: FxHashMap<MethodId, Method>,
    next_method: u32,
    next_entry_pc: Pc,
}

impl CodeCache {
    /// Create an empty code cache
    pub fn new() -> Self {
        Self {
            blobs: Vec::new(),
            blob_names: FxHashMap::default(),
            methods: FxHashMap::default(),
            next_method: 0,
            next_entry_pc: ENTRY_STUB_BEGIN,
        }
    }

    /// Register a compiled blob and assign its pc range
    pub fn register_blob(&mut self, mut blob: CodeBlob) -> ContinuationResult<BlobId> {
        blob.validate()?;
        let id = BlobId(self.blobs.len() as u32);
        blob.begin = CODE_HEAP_BEGIN + self.blobs.len() as Pc * CODE_BLOB_SPAN;
        self.blob_names.insert(blob.name.clone(), id);
        self.blobs.push(blob);
        Ok(id)
    }

    /// Register an interpreted method
    pub fn register_method(&mut self, method: Method) -> MethodId {
        let id = MethodId(self.next_method);
        self.next_method += 1;
        self.methods.insert(id, method);
        id
    }

    /// Look up a blob
    pub fn blob(&self, id: BlobId) -> ContinuationResult<&CodeBlob> {
        self.blobs
            .get(id.0 as usize)
            .ok_or_else(|| ContinuationError::invariant(format!("unknown blob {}", id.0)))
    }

    /// Look up a blob by name
    pub fn blob_named(&self, name: &str) -> Option<BlobId> {
        self.blob_names.get(name).copied()
    }

    /// Look up a method
    pub fn method(&self, id: MethodId) -> ContinuationResult<&Method> {
        self.methods
            .get(&id)
            .ok_or_else(|| ContinuationError::invariant(format!("unknown method {}", id.0)))
    }

    /// Find the blob containing `pc`
    pub fn find_blob(&self, pc: Pc) -> Option<BlobId> {
        if pc < CODE_HEAP_BEGIN {
            return None;
        }
        let index = ((pc - CODE_HEAP_BEGIN) / CODE_BLOB_SPAN) as usize;
        (index < self.blobs.len()).then_some(BlobId(index as u32))
    }

    /// Whether `pc` is interpreter code
    #[inline]
    pub fn is_interpreter_pc(&self, pc: Pc) -> bool {
        (INTERPRETER_CODE_BEGIN..INTERPRETER_CODE_END).contains(&pc)
    }

    /// Resume pc of an interpreted frame stopped at `bci`
    #[inline]
    pub fn interpreter_pc(&self, bci: u32) -> Pc {
        INTERPRETER_CODE_BEGIN + Pc::from(bci) % (INTERPRETER_CODE_END - INTERPRETER_CODE_BEGIN)
    }

    /// Whether `pc` is the return barrier
    #[inline]
    pub fn is_return_barrier(&self, pc: Pc) -> bool {
        pc == RETURN_BARRIER_PC
    }

    /// Allocate the pc of a new continuation entry stub
    pub fn new_entry_pc(&mut self) -> Pc {
        let pc = self.next_entry_pc;
        self.next_entry_pc += ENTRY_STUB_SIZE;
        pc
    }

    /// Number of registered blobs
    pub fn blob_count(&self) -> usize {
        self.blobs.len()
    }
}

impl Default for CodeCache {
    fn default() -> Self {
        Self::new()
    }
}
