use super::memory::Address;
use super::ty::Ty;
use std::rc::Rc;

/// ## Variable descriptors
///
/// One `Variable` per distinct storage-backed name form: scalars,
/// arrays, parameters, synthesized temporaries, and record fields.
/// Descriptors are built by the analyzer and immutable afterwards.

#[derive(Clone, Debug, PartialEq)]
pub struct ArrayBounds {
    /// None until a runtime DIM computes it (dynamic array).
    pub lower: Option<i32>,
    pub upper: Option<i32>,
}

#[derive(Debug)]
pub struct Variable {
    pub name: Rc<str>,
    pub ty: Ty,
    /// None for scalars. Present (possibly unresolved) for arrays.
    pub dims: Option<Vec<ArrayBounds>>,
    /// Storage location. Record fields instead locate through
    /// `parent`; everything else is assigned an address when defined.
    pub address: Option<Address>,
    /// Record field: the record variable this is a field of, plus the
    /// flat slot offset of the field within it.
    pub parent: Option<(Rc<Variable>, usize)>,
    pub is_parameter: bool,
    pub is_shared: bool,
    pub is_static: bool,
    pub as_type: bool,
}

impl Variable {
    pub fn scalar(name: Rc<str>, ty: Ty, address: Address) -> Variable {
        Variable {
            name,
            ty,
            dims: None,
            address: Some(address),
            parent: None,
            is_parameter: false,
            is_shared: false,
            is_static: false,
            as_type: false,
        }
    }

    pub fn array(name: Rc<str>, ty: Ty, dims: Vec<ArrayBounds>, address: Address) -> Variable {
        Variable {
            dims: Some(dims),
            ..Variable::scalar(name, ty, address)
        }
    }

    pub fn field(parent: &Rc<Variable>, offset: usize, name: Rc<str>, ty: Ty) -> Variable {
        Variable {
            name,
            ty,
            dims: None,
            address: None,
            parent: Some((parent.clone(), offset)),
            is_parameter: false,
            is_shared: false,
            is_static: false,
            as_type: false,
        }
    }

    pub fn is_array(&self) -> bool {
        self.dims.is_some()
    }

    /// Bounds not known until DIM executes.
    pub fn is_dynamic(&self) -> bool {
        match &self.dims {
            Some(dims) => dims.iter().any(|b| b.lower.is_none() || b.upper.is_none()),
            None => false,
        }
    }

    /// Slots one element occupies (1 except for record arrays).
    pub fn element_span(&self) -> usize {
        self.ty.span()
    }
}
