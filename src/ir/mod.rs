//! The IR module: a typed SSA graph that owns every type, constant, global,
//! function and entry point it contains (spec.md §3). Grounded in the
//! `TypeRegistry`/`FunctionRegistry` pair of `spirq_core::ty::reg` and
//! `spirq_core::func`, generalized from two standalone maps into one
//! `Module` that also mints the ids those registries were keyed by, and
//! from `HashMap`-only storage into a `Vec` + index-map pair so iteration
//! order matches construction order (required by spec.md §5's ordering
//! rule: "Instructions...in call order; blocks...by creation; globals by
//! creation").
pub mod builder;
pub mod constant;
pub mod entry;
pub mod func;
pub mod global;
pub mod inst;
pub mod ty;

use fnv::FnvHashMap as HashMap;
use nohash_hasher::IntMap;

use crate::error::{anyhow, Result};
use constant::{Constant, ConstantKind, ScalarKey};
use entry::EntryPoint;
use func::Function;
use global::GlobalVariable;
use ty::{Type, TypeKey};

/// A 32-bit identifier, stable for the lifetime of the module, minted
/// monotonically from 1 (0 is the null id, spec.md §3).
pub type Id = u32;

pub const NULL_ID: Id = 0;

#[derive(Default)]
struct Registry<T> {
    items: Vec<T>,
    // Parallel to `items`: the id each entry was inserted under, so
    // insertion order (ids interleave across entity kinds and are not
    // contiguous within one registry) can still be recovered without a
    // second pass through `index`.
    ids: Vec<Id>,
    // Keyed by `Id`, which is already a dense hash of itself: skip the
    // general-purpose SipHash fnv pulls in and index straight off the bits.
    index: IntMap<Id, usize>,
}
impl<T> Registry<T> {
    fn insert(&mut self, id: Id, item: T) {
        self.index.insert(id, self.items.len());
        self.ids.push(id);
        self.items.push(item);
    }
    fn get(&self, id: Id) -> Option<&T> {
        self.index.get(&id).map(|&i| &self.items[i])
    }
    fn get_mut(&mut self, id: Id) -> Option<&mut T> {
        match self.index.get(&id) {
            Some(&i) => Some(&mut self.items[i]),
            None => None,
        }
    }
    fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
    /// Insertion-ordered `(id, item)` pairs — the order spec.md §5 requires
    /// for emitters that must define an operand before its first use.
    fn iter_with_ids(&self) -> impl Iterator<Item = (Id, &T)> {
        self.ids.iter().copied().zip(self.items.iter())
    }
    fn len(&self) -> usize {
        self.items.len()
    }
}

/// The shader SSA IR module (C1).
pub struct Module {
    next_id: Id,
    types: Registry<Type>,
    type_intern: HashMap<TypeKey, Id>,
    consts: Registry<Constant>,
    scalar_intern: HashMap<ScalarKey, Id>,
    used_spec_ids: IntMap<u32, Id>,
    globals: Registry<GlobalVariable>,
    functions: Registry<Function>,
    entry_points: Vec<EntryPoint>,
    debug_names: IntMap<Id, String>,
    /// Maps a block id to the function id that owns it, so validator-style
    /// global queries (e.g. "does X branch to Y") don't need a function
    /// handle in hand.
    block_owner: IntMap<Id, Id>,
}
impl Default for Module {
    fn default() -> Self {
        Module::new()
    }
}
impl Module {
    pub fn new() -> Self {
        Module {
            next_id: 1,
            types: Registry::default(),
            type_intern: HashMap::default(),
            consts: Registry::default(),
            scalar_intern: HashMap::default(),
            used_spec_ids: IntMap::default(),
            globals: Registry::default(),
            functions: Registry::default(),
            entry_points: Vec::new(),
            debug_names: IntMap::default(),
            block_owner: IntMap::default(),
        }
    }

    /// Reserve an id before the entity it names is constructed, used when a
    /// block's id must be referenced from a branch emitted before the block
    /// itself exists.
    pub fn alloc_id(&mut self) -> Id {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// One past the highest id ever minted; emitters that need ids of
    /// their own (an `OpExtInstImport` set, a synthesized `OpTypeFunction`)
    /// start allocating from here rather than disturbing the IR's own
    /// id space.
    pub fn id_bound(&self) -> Id {
        self.next_id
    }

    // --- Types -----------------------------------------------------------

    pub fn get_type(&self, id: Id) -> Result<&Type> {
        self.types.get(id).ok_or_else(|| anyhow!("missing type id {}", id))
    }
    pub fn types(&self) -> impl Iterator<Item = (Id, &Type)> {
        self.types.iter_with_ids()
    }
    pub fn type_count(&self) -> usize {
        self.types.len()
    }

    /// Intern a type, returning the existing id if a structurally identical
    /// type was already registered (spec.md §4.1's kind-specific equality).
    /// Struct types are never deduplicated: their identity is nominal, so
    /// every call mints a fresh id.
    pub(crate) fn intern_type(&mut self, ty: Type) -> Id {
        if let Some(key) = ty.key() {
            if let Some(&id) = self.type_intern.get(&key) {
                return id;
            }
            let id = self.alloc_id();
            self.type_intern.insert(key, id);
            self.types.insert(id, ty);
            id
        } else {
            let id = self.alloc_id();
            self.types.insert(id, ty);
            id
        }
    }

    // --- Constants ---------------------------------------------------------

    pub fn get_const(&self, id: Id) -> Result<&Constant> {
        self.consts
            .get(id)
            .ok_or_else(|| anyhow!("missing constant id {}", id))
    }
    pub fn consts(&self) -> impl Iterator<Item = (Id, &Constant)> {
        self.consts.iter_with_ids()
    }

    /// Intern a scalar constant by (type, bit pattern). Composite and null
    /// constants are never deduplicated.
    pub(crate) fn intern_scalar(&mut self, ty: Id, value: constant::ScalarValue) -> Id {
        let key = ScalarKey { ty, value };
        if let Some(&id) = self.scalar_intern.get(&key) {
            return id;
        }
        let id = self.alloc_id();
        self.scalar_intern.insert(key, id);
        self.consts.insert(
            id,
            Constant {
                ty,
                kind: ConstantKind::Scalar(value),
                spec_id: None,
            },
        );
        id
    }

    pub(crate) fn insert_const(&mut self, constant: Constant) -> Result<Id> {
        if let Some(spec_id) = constant.spec_id {
            if self.used_spec_ids.contains_key(&spec_id) {
                return Err(anyhow!("spec_id {} already in use", spec_id));
            }
        }
        let id = self.alloc_id();
        if let Some(spec_id) = constant.spec_id {
            self.used_spec_ids.insert(spec_id, id);
        }
        self.consts.insert(id, constant);
        Ok(id)
    }

    // --- Globals -----------------------------------------------------------

    pub fn get_global(&self, id: Id) -> Result<&GlobalVariable> {
        self.globals
            .get(id)
            .ok_or_else(|| anyhow!("missing global id {}", id))
    }
    pub fn globals(&self) -> impl Iterator<Item = &GlobalVariable> {
        self.globals.iter()
    }
    pub(crate) fn insert_global(&mut self, global: GlobalVariable) {
        self.globals.insert(global.id, global);
    }

    // --- Functions -----------------------------------------------------------

    pub fn get_function(&self, id: Id) -> Result<&Function> {
        self.functions
            .get(id)
            .ok_or_else(|| anyhow!("missing function id {}", id))
    }
    pub fn get_function_mut(&mut self, id: Id) -> Result<&mut Function> {
        self.functions
            .get_mut(id)
            .ok_or_else(|| anyhow!("missing function id {}", id))
    }
    pub fn functions(&self) -> impl Iterator<Item = &Function> {
        self.functions.iter()
    }
    pub(crate) fn insert_function(&mut self, func: Function) {
        self.functions.insert(func.id, func);
    }
    pub(crate) fn set_block_owner(&mut self, block: Id, func: Id) {
        self.block_owner.insert(block, func);
    }
    pub fn block_owner(&self, block: Id) -> Option<Id> {
        self.block_owner.get(&block).copied()
    }

    // --- Entry points -----------------------------------------------------

    pub fn entry_points(&self) -> &[EntryPoint] {
        &self.entry_points
    }
    /// Returns the index of the newly pushed entry point.
    pub(crate) fn push_entry_point(&mut self, ep: EntryPoint) -> usize {
        self.entry_points.push(ep);
        self.entry_points.len() - 1
    }
    pub(crate) fn entry_point_mut(&mut self, index: usize) -> Option<&mut EntryPoint> {
        self.entry_points.get_mut(index)
    }

    // --- Debug names --------------------------------------------------------

    pub fn set_name(&mut self, id: Id, name: impl Into<String>) {
        self.debug_names.insert(id, name.into());
    }
    pub fn name(&self, id: Id) -> Option<&str> {
        self.debug_names.get(&id).map(|s| s.as_str())
    }
}
