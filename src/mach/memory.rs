use super::val::Val;
use super::var::Variable;
use crate::error;
use crate::lang::Error;
use std::collections::HashMap;
use std::rc::Rc;

type Result<T> = std::result::Result<T, Error>;

/// ## Segmented memory
///
/// Three storage classes, each backed by flat value frames. Static
/// storage is one frame with program lifetime, automatic frames are
/// pushed and popped with procedure calls, and dynamic frames are
/// allocated individually for resizable arrays. Addresses are never
/// reused while their owning frame is live; a disposed frame marks
/// itself dead so a stale address raises instead of reading garbage.

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StorageClass {
    Static,
    Automatic,
    Dynamic,
}

/// (storage class, frame, slot) locator. An automatic address without
/// a frame index refers to the innermost live frame; pinning one for
/// a reference value captures the concrete frame so the reference
/// stays valid from inside a callee.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Address {
    pub class: StorageClass,
    pub frame: Option<usize>,
    pub slot: usize,
}

impl Address {
    pub fn new(class: StorageClass, slot: usize) -> Address {
        Address {
            class,
            frame: None,
            slot,
        }
    }

    pub fn offset(self, slots: usize) -> Address {
        Address {
            slot: self.slot + slots,
            ..self
        }
    }
}

/// A flat array of value slots backing one storage class instance.
#[derive(Debug)]
pub struct Frame {
    values: Vec<Option<Val>>,
    live: bool,
}

impl Frame {
    fn new(size: usize) -> Frame {
        Frame {
            values: vec![None; size],
            live: true,
        }
    }

    fn read(&self, slot: usize) -> Result<Option<Val>> {
        self.check(slot)?;
        Ok(self.values[slot].clone())
    }

    fn write(&mut self, slot: usize, value: Option<Val>) -> Result<()> {
        self.check(slot)?;
        self.values[slot] = value;
        Ok(())
    }

    fn reset(&mut self) {
        for slot in self.values.iter_mut() {
            *slot = None;
        }
    }

    fn dispose(&mut self) {
        self.values.clear();
        self.live = false;
    }

    fn check(&self, slot: usize) -> Result<()> {
        if !self.live {
            return Err(error!(InternalError; "Frame is not live"));
        }
        if slot >= self.values.len() {
            return Err(error!(InternalError; "Slot out of bounds"));
        }
        Ok(())
    }
}

/// How many links a reference chain may have before we assume a cycle.
const MAX_CHAIN_DEPTH: usize = 1000;

pub struct Memory {
    statics: Frame,
    stack: Vec<Frame>,
    dynamic: Vec<Frame>,
    segment: i32,
    pointers: HashMap<i32, (Address, Rc<Variable>)>,
    next_pointer: i32,
}

impl Memory {
    pub fn new(static_size: usize) -> Memory {
        Memory {
            statics: Frame::new(static_size),
            stack: vec![],
            dynamic: vec![],
            segment: 0,
            pointers: HashMap::new(),
            next_pointer: 1,
        }
    }

    pub fn clear(&mut self) {
        self.statics.reset();
        self.stack.clear();
        self.dynamic.clear();
    }

    pub fn push_stack(&mut self, size: usize) {
        log::debug!("push automatic frame of {} slots", size);
        self.stack.push(Frame::new(size));
    }

    pub fn pop_stack(&mut self) -> Result<()> {
        log::debug!("pop automatic frame");
        match self.stack.last_mut() {
            Some(frame) => {
                frame.dispose();
                self.stack.pop();
                Ok(())
            }
            None => Err(error!(InternalError; "Stack empty")),
        }
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    /// Capture the concrete frame index of an automatic address so a
    /// reference built from it survives later pushes.
    pub fn pin(&self, address: Address) -> Address {
        match address {
            Address {
                class: StorageClass::Automatic,
                frame: None,
                slot,
            } => Address {
                class: StorageClass::Automatic,
                frame: Some(self.stack.len().wrapping_sub(1)),
                slot,
            },
            other => other,
        }
    }

    pub fn allocate(&mut self, size: usize) -> Address {
        let frame = self.dynamic.len();
        log::debug!("allocate dynamic frame {} of {} slots", frame, size);
        self.dynamic.push(Frame::new(size));
        Address {
            class: StorageClass::Dynamic,
            frame: Some(frame),
            slot: 0,
        }
    }

    pub fn deallocate(&mut self, address: Address) -> Result<()> {
        if address.class != StorageClass::Dynamic {
            return Err(error!(InternalError; "Tried to free non-dynamic memory"));
        }
        self.dynamic_frame_mut(address.frame)?.dispose();
        Ok(())
    }

    pub fn read_address(&self, address: Address) -> Result<Option<Val>> {
        match address.class {
            StorageClass::Static => self.statics.read(address.slot),
            StorageClass::Automatic => self.stack_frame(address.frame)?.read(address.slot),
            StorageClass::Dynamic => self.dynamic_frame(address.frame)?.read(address.slot),
        }
    }

    pub fn write_address(&mut self, address: Address, value: Option<Val>) -> Result<()> {
        match address.class {
            StorageClass::Static => self.statics.write(address.slot, value),
            StorageClass::Automatic => {
                let top = self.stack.len().wrapping_sub(1);
                let frame = address.frame.unwrap_or(top);
                self.stack_frame_mut(frame)?.write(address.slot, value)
            }
            StorageClass::Dynamic => {
                self.dynamic_frame_mut(address.frame)?.write(address.slot, value)
            }
        }
    }

    /// Resolve a variable to the address of its storage, walking
    /// reference chains (by-reference parameters, array-element
    /// aliases) and applying record-field offsets. The value at the
    /// final address rides along since most callers want it.
    pub fn dereference(&self, variable: &Variable) -> Result<(Address, Option<Val>)> {
        let (base, field_offset) = match &variable.parent {
            Some((record, offset)) => {
                let (address, _) = self.dereference(record)?;
                (address, *offset)
            }
            None => {
                let address = variable
                    .address
                    .ok_or_else(|| error!(InternalError; "Variable has no address"))?;
                (address, 0)
            }
        };
        let mut address = base.offset(field_offset);
        let mut value = self.read_address(address)?;
        let mut depth = 0;
        while let Some(Val::Ref(reference)) = &value {
            if depth >= MAX_CHAIN_DEPTH {
                return Err(error!(InternalError; "Probable reference cycle"));
            }
            address = reference.address;
            value = self.read_address(address)?;
            depth += 1;
        }
        Ok((address, value))
    }

    pub fn read(&self, variable: &Variable) -> Result<Option<Val>> {
        let (_, value) = self.dereference(variable)?;
        Ok(value)
    }

    pub fn write(&mut self, variable: &Variable, value: Val) -> Result<()> {
        let (address, _) = self.dereference(variable)?;
        self.write_address(address, Some(value))
    }

    pub fn segment(&self) -> i32 {
        self.segment
    }

    pub fn set_segment(&mut self, segment: i32) {
        self.segment = segment;
    }

    /// Install a stable small-integer handle for a variable's address.
    /// VARSEG hands these out; PEEK, POKE and VARPTR resolve them.
    pub fn write_pointer(&mut self, address: Address, variable: Rc<Variable>) -> i32 {
        let handle = self.next_pointer;
        self.next_pointer += 1;
        self.pointers.insert(handle, (address, variable));
        handle
    }

    pub fn read_pointer(&self, handle: i32) -> Result<&(Address, Rc<Variable>)> {
        self.pointers
            .get(&handle)
            .ok_or_else(|| error!(IllegalFunctionCall; "Pointer not installed with VARSEG"))
    }

    fn stack_frame(&self, frame: Option<usize>) -> Result<&Frame> {
        let top = self.stack.len().wrapping_sub(1);
        self.stack
            .get(frame.unwrap_or(top))
            .ok_or_else(|| error!(InternalError; "Illegal stack frame"))
    }

    fn stack_frame_mut(&mut self, frame: usize) -> Result<&mut Frame> {
        self.stack
            .get_mut(frame)
            .ok_or_else(|| error!(InternalError; "Illegal stack frame"))
    }

    fn dynamic_frame(&self, frame: Option<usize>) -> Result<&Frame> {
        let frame = frame.ok_or_else(|| error!(InternalError; "Missing frame index"))?;
        self.dynamic
            .get(frame)
            .ok_or_else(|| error!(InternalError; "Illegal dynamic frame"))
    }

    fn dynamic_frame_mut(&mut self, frame: Option<usize>) -> Result<&mut Frame> {
        let frame = frame.ok_or_else(|| error!(InternalError; "Missing frame index"))?;
        self.dynamic
            .get_mut(frame)
            .ok_or_else(|| error!(InternalError; "Illegal dynamic frame"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::ty::Ty;
    use super::super::val::Reference;

    fn static_var(name: &str, slot: usize) -> Rc<Variable> {
        Rc::new(Variable::scalar(
            name.into(),
            Ty::Integer,
            Address::new(StorageClass::Static, slot),
        ))
    }

    #[test]
    fn test_static_read_write() {
        let mut memory = Memory::new(4);
        let var = static_var("a", 2);
        memory.write(&var, Val::Integer(7)).unwrap();
        assert_eq!(memory.read(&var).unwrap(), Some(Val::Integer(7)));
    }

    #[test]
    fn test_reference_chain_resolves() {
        let mut memory = Memory::new(4);
        let target = static_var("t", 0);
        let alias = static_var("a", 1);
        memory.write(&target, Val::Integer(3)).unwrap();
        memory
            .write(
                &alias,
                Val::Ref(Reference {
                    address: target.address.unwrap(),
                    var: target.clone(),
                }),
            )
            .unwrap();
        assert_eq!(memory.read(&alias).unwrap(), Some(Val::Integer(3)));
        // Writing through the alias lands in the target's slot.
        memory.write(&alias, Val::Integer(9)).unwrap();
        assert_eq!(memory.read(&target).unwrap(), Some(Val::Integer(9)));
    }

    #[test]
    fn test_reference_cycle_detected() {
        let mut memory = Memory::new(4);
        let a = static_var("a", 0);
        let b = static_var("b", 1);
        memory
            .write_address(
                a.address.unwrap(),
                Some(Val::Ref(Reference {
                    address: b.address.unwrap(),
                    var: b.clone(),
                })),
            )
            .unwrap();
        memory
            .write_address(
                b.address.unwrap(),
                Some(Val::Ref(Reference {
                    address: a.address.unwrap(),
                    var: a.clone(),
                })),
            )
            .unwrap();
        assert!(memory.read(&a).is_err());
    }

    #[test]
    fn test_disposed_frame_raises() {
        let mut memory = Memory::new(0);
        let address = memory.allocate(2);
        memory.write_address(address, Some(Val::Integer(1))).unwrap();
        memory.deallocate(address).unwrap();
        assert!(memory.read_address(address).is_err());
    }

    #[test]
    fn test_automatic_frames_push_pop() {
        let mut memory = Memory::new(0);
        memory.push_stack(2);
        let address = Address::new(StorageClass::Automatic, 0);
        memory.write_address(address, Some(Val::Integer(5))).unwrap();
        let pinned = memory.pin(address);
        assert_eq!(pinned.frame, Some(0));
        memory.push_stack(1);
        // The pinned address still reads the outer frame.
        assert_eq!(memory.read_address(pinned).unwrap(), Some(Val::Integer(5)));
        memory.pop_stack().unwrap();
        memory.pop_stack().unwrap();
        assert!(memory.pop_stack().is_err());
    }
}
