use super::common::CommonBlock;
use super::devices::Devices;
use super::events::Events;
use super::files::{Files, MemoryOpener, Opener};
use super::memory::Memory;
use super::program::DataItem;
use rand::{Rng as _, SeedableRng};
use std::rc::Rc;

/// ## Execution context
///
/// Everything a statement may touch at run time, single-owner and
/// mutated only from inside a step: memory, devices, event traps, the
/// DATA cursor, open files, the RNG, and the COMMON transfer block.

pub struct ExecutionContext {
    pub memory: Memory,
    pub devices: Devices,
    pub events: Events,
    pub data: ProgramData,
    pub files: Files,
    pub opener: Box<dyn Opener>,
    pub rng: Randoms,
    pub common: CommonBlock,
    /// Set by CHAIN before it halts; the host starts the successor.
    pub chained: Option<Rc<str>>,
    /// Serialized COMMON envelope for the successor program.
    pub chain_envelope: Option<Vec<u8>>,
}

impl ExecutionContext {
    pub fn new(devices: Devices, static_size: usize, data: Rc<Vec<DataItem>>) -> ExecutionContext {
        ExecutionContext {
            memory: Memory::new(static_size),
            devices,
            events: Events::new(),
            data: ProgramData::new(data),
            files: Files::new(),
            opener: Box::new(MemoryOpener::new()),
            rng: Randoms::new(),
            common: CommonBlock::new(),
            chained: None,
            chain_envelope: None,
        }
    }
}

/// One monotonic DATA cursor shared across the whole program, no
/// matter which chunk is reading.
pub struct ProgramData {
    items: Rc<Vec<DataItem>>,
    index: usize,
}

impl ProgramData {
    pub fn new(items: Rc<Vec<DataItem>>) -> ProgramData {
        ProgramData { items, index: 0 }
    }

    pub fn read(&mut self) -> Option<DataItem> {
        let item = self.items.get(self.index).cloned();
        if item.is_some() {
            self.index += 1;
        }
        item
    }

    pub fn restore(&mut self, index: usize) {
        self.index = index.min(self.items.len());
    }
}

/// RND/RANDOMIZE state: a reseedable generator that repeats its last
/// value on RND(0) and produces a deterministic sequence for a given
/// seed.
pub struct Randoms {
    rng: rand::rngs::StdRng,
    last: f32,
}

impl Randoms {
    pub fn new() -> Randoms {
        Randoms {
            rng: rand::rngs::StdRng::seed_from_u64(0),
            last: 0.0,
        }
    }

    pub fn reseed(&mut self, seed: f64) {
        self.rng = rand::rngs::StdRng::seed_from_u64(seed.to_bits());
    }

    pub fn next(&mut self) -> f32 {
        self.last = self.rng.gen_range(0.0..1.0);
        self.last
    }

    pub fn last(&self) -> f32 {
        self.last
    }
}

impl Default for Randoms {
    fn default() -> Randoms {
        Randoms::new()
    }
}
