use super::ty::Ty;
use super::val::Val;
use super::var::Variable;
use crate::error;
use crate::lang::Error;
use std::rc::Rc;

type Result<T> = std::result::Result<T, Error>;

/// ## Symbol table
///
/// Procedures, constants, and variables share one namespace, but a
/// name can back several distinct variables: scalars and arrays are
/// independent, and differently-typed forms of a name coexist. At
/// most one of a name's scalar forms and one of its array forms may
/// carry an explicit AS type, and every later reference must agree
/// with it.
///
///   DIM x AS STRING, x(5) AS STRING  ' ok
///   DIM x AS STRING, x(5) AS INTEGER ' Duplicate definition
///   x = 42                           ' Type mismatch
///   x$(5) = "ok"                     ' ok

#[derive(Clone, Debug)]
pub struct Procedure {
    pub name: Rc<str>,
    pub params: Vec<Rc<Variable>>,
    /// FUNCTION and DEF FN result variable, named after the procedure
    /// and stored in the callee frame.
    pub result: Option<Rc<Variable>>,
    pub chunk: usize,
    pub is_static: bool,
}

#[derive(Clone, Debug)]
pub enum Symbol {
    Procedure(Rc<Procedure>),
    Constant(Val),
    Variable(Rc<Variable>),
}

#[derive(Default, Debug)]
struct Slot {
    procedure: Option<Rc<Procedure>>,
    constant: Option<Val>,
    /// DEF FN bodies, one per result type.
    def_fns: Vec<Rc<Procedure>>,
    scalars: Vec<Rc<Variable>>,
    arrays: Vec<Rc<Variable>>,
    scalar_as_type: Option<Ty>,
    array_as_type: Option<Ty>,
}

/// Type identity for namespace purposes: the tag only, so STRING * 4
/// and STRING * 8 occupy the same form of a name.
fn same_tag(a: &Ty, b: &Ty) -> bool {
    std::mem::discriminant(a) == std::mem::discriminant(b)
}

#[derive(Default, Debug)]
pub struct SymbolTable {
    /// Insertion-ordered so that storage layout and generated code
    /// are deterministic.
    slots: Vec<(Rc<str>, Slot)>,
}

impl SymbolTable {
    pub fn new() -> SymbolTable {
        SymbolTable::default()
    }

    fn slot(&self, name: &str) -> Option<&Slot> {
        self.slots
            .iter()
            .find(|(slot_name, _)| &**slot_name == name)
            .map(|(_, slot)| slot)
    }

    fn slot_mut(&mut self, name: &Rc<str>) -> &mut Slot {
        if let Some(index) = self.slots.iter().position(|(n, _)| n == name) {
            return &mut self.slots[index].1;
        }
        self.slots.push((name.clone(), Slot::default()));
        &mut self.slots.last_mut().unwrap().1
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slot(name).is_some()
    }

    pub fn lookup_constant(&self, name: &str) -> Option<Val> {
        self.slot(name).and_then(|slot| slot.constant.clone())
    }

    pub fn lookup_procedure(&self, name: &str) -> Option<Rc<Procedure>> {
        self.slot(name).and_then(|slot| slot.procedure.clone())
    }

    /// The record-typed form of a name, if one exists. Field access on
    /// a dotted name binds to it before any plain dotted variable.
    pub fn lookup_record(&self, name: &str, array: bool) -> Option<Rc<Variable>> {
        let slot = self.slot(name)?;
        let forms = if array { &slot.arrays } else { &slot.scalars };
        forms
            .iter()
            .find(|v| matches!(v.ty, Ty::Record(_)))
            .cloned()
    }

    /// The AS type pinned to either form of a name, if any.
    pub fn as_type(&self, name: &str) -> Option<Ty> {
        self.slot(name).and_then(|slot| {
            slot.scalar_as_type
                .clone()
                .or_else(|| slot.array_as_type.clone())
        })
    }

    /// Find an existing symbol compatible with a use of `name` at
    /// `ty`. `None` means the caller should define a fresh variable;
    /// definition is where shape conflicts turn into errors.
    pub fn find(&self, name: &str, ty: &Ty, is_default_ty: bool, dims: usize) -> Option<Symbol> {
        let slot = self.slot(name)?;
        if let Some(procedure) = &slot.procedure {
            let result_matches = match &procedure.result {
                Some(result) => same_tag(ty, &result.ty),
                None => true,
            };
            if result_matches {
                return Some(Symbol::Procedure(procedure.clone()));
            }
        }
        for def_fn in &slot.def_fns {
            if let Some(result) = &def_fn.result {
                if same_tag(ty, &result.ty) {
                    return Some(Symbol::Procedure(def_fn.clone()));
                }
            }
        }
        if let Some(constant) = &slot.constant {
            if is_default_ty || same_tag(ty, &constant_ty(constant)) {
                return Some(Symbol::Constant(constant.clone()));
            }
        }
        if dims == 0 {
            let as_type = if is_default_ty {
                slot.scalar_as_type.as_ref()
            } else {
                slot.scalar_as_type.as_ref().or(slot.array_as_type.as_ref())
            };
            if as_type.map_or(true, |as_ty| as_ty == ty) {
                for variable in &slot.scalars {
                    if same_tag(&variable.ty, ty) {
                        return Some(Symbol::Variable(variable.clone()));
                    }
                }
            }
        } else {
            let as_type = if is_default_ty {
                slot.array_as_type.as_ref()
            } else {
                slot.array_as_type.as_ref().or(slot.scalar_as_type.as_ref())
            };
            if as_type.map_or(true, |as_ty| as_ty == ty) {
                for variable in &slot.arrays {
                    if same_tag(&variable.ty, ty) {
                        return Some(Symbol::Variable(variable.clone()));
                    }
                }
            }
        }
        None
    }

    pub fn define_variable(&mut self, variable: Rc<Variable>) -> Result<()> {
        let name = variable.name.clone();
        let slot = self.slot_mut(&name);
        if slot.procedure.is_some() || slot.constant.is_some() || !slot.def_fns.is_empty() {
            return Err(error!(DuplicateDefinition));
        }
        if !variable.is_array() {
            let as_type = slot.scalar_as_type.as_ref().or(slot.array_as_type.as_ref());
            if as_type.map_or(false, |as_ty| as_ty != &variable.ty) {
                return Err(error!(DuplicateDefinition));
            }
            if slot.scalars.iter().any(|v| same_tag(&v.ty, &variable.ty)) {
                return Err(error!(DuplicateDefinition));
            }
            if variable.as_type {
                slot.scalar_as_type = Some(variable.ty.clone());
            }
            slot.scalars.push(variable);
        } else {
            let as_type = slot.array_as_type.as_ref().or(slot.scalar_as_type.as_ref());
            if as_type.map_or(false, |as_ty| as_ty != &variable.ty) {
                return Err(error!(DuplicateDefinition));
            }
            if slot.arrays.iter().any(|v| same_tag(&v.ty, &variable.ty)) {
                return Err(error!(DuplicateDefinition));
            }
            if variable.as_type {
                slot.array_as_type = Some(variable.ty.clone());
            }
            slot.arrays.push(variable);
        }
        Ok(())
    }

    pub fn define_constant(&mut self, name: Rc<str>, value: Val) -> Result<()> {
        if self.contains(&name) {
            return Err(error!(DuplicateDefinition));
        }
        self.slot_mut(&name).constant = Some(value);
        Ok(())
    }

    pub fn define_procedure(&mut self, procedure: Rc<Procedure>) -> Result<()> {
        if self.contains(&procedure.name) {
            return Err(error!(DuplicateDefinition));
        }
        let name = procedure.name.clone();
        self.slot_mut(&name).procedure = Some(procedure);
        Ok(())
    }

    /// DEF FN bodies are keyed by result type; several may share a
    /// name, one per sigil form.
    pub fn define_def_fn(&mut self, procedure: Rc<Procedure>) -> Result<()> {
        let name = procedure.name.clone();
        let existing = self.slot(&name).is_some();
        let slot = self.slot_mut(&name);
        if existing && slot.def_fns.is_empty() {
            return Err(error!(DuplicateDefinition));
        }
        let result_ty = &procedure.result.as_ref().unwrap().ty;
        if slot
            .def_fns
            .iter()
            .any(|p| same_tag(&p.result.as_ref().unwrap().ty, result_ty))
        {
            return Err(error!(DuplicateDefinition));
        }
        slot.def_fns.push(procedure);
        Ok(())
    }

    /// Every variable the table defines, in definition order.
    pub fn variables(&self) -> impl Iterator<Item = &Rc<Variable>> {
        self.slots
            .iter()
            .flat_map(|(_, slot)| slot.scalars.iter().chain(slot.arrays.iter()))
    }
}

fn constant_ty(value: &Val) -> Ty {
    match value {
        Val::Integer(_) => Ty::Integer,
        Val::Long(_) => Ty::Long,
        Val::Single(_) => Ty::Single,
        Val::Double(_) => Ty::Double,
        _ => Ty::String,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mach::memory::{Address, StorageClass};

    fn var(name: &str, ty: Ty, slot: usize) -> Rc<Variable> {
        Rc::new(Variable::scalar(
            name.into(),
            ty,
            Address::new(StorageClass::Static, slot),
        ))
    }

    #[test]
    fn test_scalar_types_coexist() {
        let mut table = SymbolTable::new();
        table.define_variable(var("x", Ty::Single, 0)).unwrap();
        table.define_variable(var("x", Ty::String, 1)).unwrap();
        assert!(table.find("x", &Ty::Single, true, 0).is_some());
        assert!(table.find("x", &Ty::String, false, 0).is_some());
        assert!(table.define_variable(var("x", Ty::Single, 2)).is_err());
    }

    #[test]
    fn test_as_type_pins_scalar_form() {
        let mut table = SymbolTable::new();
        let mut pinned = Variable::scalar(
            "x".into(),
            Ty::String,
            Address::new(StorageClass::Static, 0),
        );
        pinned.as_type = true;
        table.define_variable(Rc::new(pinned)).unwrap();
        // An untyped use no longer finds a SINGLE form and a fresh
        // definition collides with the AS type.
        assert!(table.find("x", &Ty::Single, true, 0).is_none());
        assert!(table.define_variable(var("x", Ty::Single, 1)).is_err());
        // Arrays of the same name are an independent form.
        assert!(table.find("x", &Ty::Single, true, 1).is_none());
    }

    #[test]
    fn test_constant_shadows_variable_definition() {
        let mut table = SymbolTable::new();
        table
            .define_constant("limit".into(), Val::Integer(10))
            .unwrap();
        assert!(table.define_variable(var("limit", Ty::Single, 0)).is_err());
        match table.find("limit", &Ty::Single, true, 0) {
            Some(Symbol::Constant(Val::Integer(10))) => {}
            other => panic!("unexpected {:?}", other),
        }
    }
}
