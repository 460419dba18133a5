//! Sections and subsections.

use cranelift_entity::packed_option::PackedOption;

use crate::fx::FxHashMap;
use crate::ir::entities::{Entry, Section, SubSec};

/// Map from entry to a byte count, produced by the relaxer.
pub type EntrySizeMap = FxHashMap<Entry, u32>;

/// A named section. Owns its subsections and the size/offset maps the
/// relaxer computes for the entries it contains.
pub struct SectionData {
    pub name: Box<str>,
    pub subsections: Vec<SubSec>,
    sizes: Option<EntrySizeMap>,
    offsets: Option<EntrySizeMap>,
}

impl SectionData {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            subsections: Vec::new(),
            sizes: None,
            offsets: None,
        }
    }

    /// The cached size map, if relaxation has run since the last
    /// invalidation.
    pub fn sizes(&self) -> Option<&EntrySizeMap> {
        self.sizes.as_ref()
    }

    /// The cached offset map.
    pub fn offsets(&self) -> Option<&EntrySizeMap> {
        self.offsets.as_ref()
    }

    /// Has the relaxer populated this section?
    pub fn has_size_map(&self) -> bool {
        self.sizes.is_some()
    }

    /// Install freshly computed maps. Both are set together.
    pub(crate) fn set_maps(&mut self, sizes: EntrySizeMap, offsets: EntrySizeMap) {
        self.sizes = Some(sizes);
        self.offsets = Some(offsets);
    }

    /// Discard both maps. The next size or offset query reruns relaxation.
    pub fn invalidate_sizes(&mut self) {
        self.sizes = None;
        self.offsets = None;
    }
}

/// A subsection: one contiguous entry chain within a section.
pub struct SubSectionData {
    pub section: Section,
    pub(crate) first_entry: PackedOption<Entry>,
    pub(crate) last_entry: PackedOption<Entry>,
}

impl SubSectionData {
    pub fn new(section: Section) -> Self {
        Self {
            section,
            first_entry: None.into(),
            last_entry: None.into(),
        }
    }

    /// First entry in the chain, or `None` when empty.
    pub fn first_entry(&self) -> Option<Entry> {
        self.first_entry.expand()
    }

    /// Last entry in the chain, or `None` when empty.
    pub fn last_entry(&self) -> Option<Entry> {
        self.last_entry.expand()
    }
}
