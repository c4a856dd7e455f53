use crate::lang::ast;
use std::rc::Rc;

/// ## Value types
///
/// The five scalar types plus fixed-length strings and user-defined
/// records. Array variables carry their element type here and their
/// shape on the variable descriptor. Records compare by declared
/// name, never by shape.

#[derive(Clone, Debug)]
pub enum Ty {
    Integer,
    Long,
    Single,
    Double,
    String,
    FixedString(usize),
    Record(Rc<RecordTy>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct RecordTy {
    pub name: Rc<str>,
    pub fields: Vec<(Rc<str>, Ty)>,
}

impl PartialEq for Ty {
    fn eq(&self, other: &Ty) -> bool {
        use Ty::*;
        match (self, other) {
            (Integer, Integer) | (Long, Long) | (Single, Single) | (Double, Double)
            | (String, String) => true,
            (FixedString(a), FixedString(b)) => a == b,
            (Record(a), Record(b)) => a.name == b.name,
            _ => false,
        }
    }
}

impl Ty {
    pub fn of_sigil(sigil: char) -> Ty {
        match sigil {
            '%' => Ty::Integer,
            '&' => Ty::Long,
            '!' => Ty::Single,
            '#' => Ty::Double,
            '$' => Ty::String,
            _ => panic!("invalid type sigil"),
        }
    }

    pub fn of_scalar(scalar: ast::ScalarType) -> Ty {
        match scalar {
            ast::ScalarType::Integer => Ty::Integer,
            ast::ScalarType::Long => Ty::Long,
            ast::ScalarType::Single => Ty::Single,
            ast::ScalarType::Double => Ty::Double,
            ast::ScalarType::String => Ty::String,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Ty::Integer | Ty::Long | Ty::Single | Ty::Double)
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Ty::String | Ty::FixedString(_))
    }

    /// Number of memory slots a value of this type occupies. Records
    /// flatten to one slot per scalar field; everything else is one
    /// slot (arrays hold a descriptor).
    pub fn span(&self) -> usize {
        match self {
            Ty::Record(record) => record.fields.iter().map(|(_, ty)| ty.span()).sum(),
            _ => 1,
        }
    }

    /// Resolve a period-separated field path against a record type,
    /// yielding the flat slot offset and the leaf type.
    pub fn field_offset(&self, path: &[&str]) -> Option<(usize, Ty)> {
        if path.is_empty() {
            return Some((0, self.clone()));
        }
        let record = match self {
            Ty::Record(record) => record,
            _ => return None,
        };
        let mut offset = 0;
        for (name, ty) in &record.fields {
            if &**name == path[0] {
                let (inner, leaf) = ty.field_offset(&path[1..])?;
                return Some((offset + inner, leaf));
            }
            offset += ty.span();
        }
        None
    }
}

impl std::fmt::Display for Ty {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Ty::Integer => write!(f, "INTEGER"),
            Ty::Long => write!(f, "LONG"),
            Ty::Single => write!(f, "SINGLE"),
            Ty::Double => write!(f, "DOUBLE"),
            Ty::String => write!(f, "STRING"),
            Ty::FixedString(n) => write!(f, "STRING * {}", n),
            Ty::Record(record) => write!(f, "{}", record.name.to_ascii_uppercase()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point() -> Ty {
        Ty::Record(Rc::new(RecordTy {
            name: "point".into(),
            fields: vec![("x".into(), Ty::Single), ("y".into(), Ty::Single)],
        }))
    }

    #[test]
    fn test_records_compare_by_name() {
        let a = point();
        let b = Ty::Record(Rc::new(RecordTy {
            name: "vec2".into(),
            fields: vec![("x".into(), Ty::Single), ("y".into(), Ty::Single)],
        }));
        assert_ne!(a, b);
        assert_eq!(a, point());
    }

    #[test]
    fn test_nested_record_span_and_offset() {
        let segment = Ty::Record(Rc::new(RecordTy {
            name: "segment".into(),
            fields: vec![("a".into(), point()), ("b".into(), point())],
        }));
        assert_eq!(segment.span(), 4);
        assert_eq!(segment.field_offset(&["b", "y"]), Some((3, Ty::Single)));
        assert_eq!(segment.field_offset(&["c"]), None);
    }
}
