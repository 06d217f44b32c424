//! Predicate evaluation and ordering for in-memory documents.
//!
//! This module provides the evaluation engine for predicate expressions,
//! enabling filtering and comparison operations on BSON documents.

use std::{cmp::Ordering, collections::HashMap};
use bson::{Bson, Document, datetime::DateTime};

use docshelf_core::{
    query::{QueryVisitor, Expr, FieldOp, Sort, SortDirection},
    error::{StorageError, StorageResult},
};


/// Type-erased, comparable representation of BSON values.
///
/// Numeric types are normalized to f64 for comparison.
#[derive(Debug)]
pub(crate) enum Comparable<'a> {
    /// Null value
    Null,
    /// Boolean value
    Bool(bool),
    /// Numeric value (all integers and floats normalized to f64)
    Number(f64),
    /// DateTime value
    DateTime(DateTime),
    /// String value
    String(&'a str),
    /// Array of comparable values
    Array(Vec<Comparable<'a>>),
    /// Map/Object of comparable values
    Map(HashMap<&'a str, Comparable<'a>>),
}

impl<'a> From<&'a Bson> for Comparable<'a> {
    fn from(bson: &'a Bson) -> Self {
        match bson {
            Bson::Null => Comparable::Null,
            Bson::Boolean(value) => Comparable::Bool(*value),
            Bson::Int32(value) => Comparable::Number(*value as f64),
            Bson::Int64(value) => Comparable::Number(*value as f64),
            Bson::Double(value) => Comparable::Number(*value),
            Bson::DateTime(value) => Comparable::DateTime(*value),
            Bson::String(value) => Comparable::String(value),
            Bson::Array(arr) => Comparable::Array(
                arr
                    .iter()
                    .map(Comparable::from)
                    .collect::<Vec<_>>()
            ),
            Bson::Document(doc) => Comparable::Map(
                doc
                    .iter()
                    .map(|(k, v)| (k.as_str(), Comparable::from(v)))
                    .collect::<HashMap<_, _>>()
            ),
            _ => Comparable::Null, // Other types are not comparable
        }
    }
}

impl<'a> PartialEq for Comparable<'a> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Comparable::Null, Comparable::Null) => true,
            (Comparable::Bool(a), Comparable::Bool(b)) => a == b,
            (Comparable::Number(a), Comparable::Number(b)) => a == b,
            (Comparable::DateTime(a), Comparable::DateTime(b)) => a == b,
            (Comparable::String(a), Comparable::String(b)) => a == b,
            (Comparable::Array(a), Comparable::Array(b)) => a == b,
            (Comparable::Map(a), Comparable::Map(b)) => a == b,
            _ => false,
        }
    }
}

impl<'a> PartialOrd for Comparable<'a> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Comparable::Bool(a), Comparable::Bool(b)) => a.partial_cmp(b),
            (Comparable::Number(a), Comparable::Number(b)) => a.partial_cmp(b),
            (Comparable::DateTime(a), Comparable::DateTime(b)) => a.partial_cmp(b),
            (Comparable::String(a), Comparable::String(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

/// Orders two documents by a list of sort keys. Missing and null values sort first.
pub(crate) fn compare_documents(left: &Document, right: &Document, sort: &[Sort]) -> Ordering {
    for key in sort {
        let a = left.get(&key.field).map(Comparable::from).unwrap_or(Comparable::Null);
        let b = right.get(&key.field).map(Comparable::from).unwrap_or(Comparable::Null);

        let ordering = match (&a, &b) {
            (Comparable::Null, Comparable::Null) => Ordering::Equal,
            (Comparable::Null, _) => Ordering::Less,
            (_, Comparable::Null) => Ordering::Greater,
            _ => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
        };
        let ordering = match key.direction {
            SortDirection::Asc => ordering,
            SortDirection::Desc => ordering.reverse(),
        };

        if ordering != Ordering::Equal {
            return ordering;
        }
    }

    Ordering::Equal
}


pub(crate) struct DocumentEvaluator<'a> {
    document: &'a Document,
}

impl<'a> DocumentEvaluator<'a> {
    pub fn new(document: &'a Document) -> Self {
        Self { document }
    }

    pub fn evaluate(&mut self, expr: &Expr) -> StorageResult<bool> {
        self.visit_expr(expr)
    }

    /// Returns `true` when `document` matches `filter`; `None` matches everything.
    pub fn matches(document: &Document, filter: Option<&Expr>) -> StorageResult<bool> {
        match filter {
            Some(expr) => DocumentEvaluator::new(document).evaluate(expr),
            None => Ok(true),
        }
    }
}

impl<'a> QueryVisitor for DocumentEvaluator<'a> {
    type Output = bool;
    type Error = StorageError;

    fn visit_and(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error> {
        for expr in exprs {
            if !self.visit_expr(expr)? {
                return Ok(false);
            }
        }

        Ok(true)
    }

    fn visit_or(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error> {
        for expr in exprs {
            if self.visit_expr(expr)? {
                return Ok(true);
            }
        }

        Ok(false)
    }

    fn visit_not(&mut self, expr: &Expr) -> Result<Self::Output, Self::Error> {
        Ok(!self.visit_expr(expr)?)
    }

    fn visit_exists(&mut self, field: &str, should_exist: bool) -> Result<Self::Output, Self::Error> {
        Ok(self.document.get(field).is_some() == should_exist)
    }

    fn visit_field(&mut self, field: &str, op: &FieldOp, value: &Bson) -> Result<Self::Output, Self::Error> {
        let Some(field_value) = self.document.get(field) else {
            return Ok(matches!(op, FieldOp::Ne | FieldOp::NotContains | FieldOp::NoneOf));
        };

        match op {
            FieldOp::Eq => Ok(equals(field_value, value)),
            FieldOp::Ne => Ok(!equals(field_value, value)),
            FieldOp::Gt | FieldOp::Gte | FieldOp::Lt | FieldOp::Lte => {
                Ok(match Comparable::from(field_value).partial_cmp(&Comparable::from(value)) {
                    Some(ordering) => match op {
                        FieldOp::Gt => ordering == Ordering::Greater,
                        FieldOp::Gte => ordering != Ordering::Less,
                        FieldOp::Lt => ordering == Ordering::Less,
                        _ => ordering != Ordering::Greater,
                    },
                    None => false,
                })
            },
            FieldOp::Contains => Ok(contains(field_value, value)),
            FieldOp::NotContains => Ok(!contains(field_value, value)),
            FieldOp::StartsWith => match (Comparable::from(field_value), Comparable::from(value)) {
                (Comparable::String(left), Comparable::String(right)) => Ok(left.starts_with(right)),
                _ => Ok(false),
            },
            FieldOp::EndsWith => match (Comparable::from(field_value), Comparable::from(value)) {
                (Comparable::String(left), Comparable::String(right)) => Ok(left.ends_with(right)),
                _ => Ok(false),
            },
            FieldOp::AnyOf => Ok(intersects(field_value, value)),
            FieldOp::NoneOf => Ok(!intersects(field_value, value)),
        }
    }
}

/// `true` when the field equals the value, or is an array with an element equal to it.
fn equals(field_value: &Bson, value: &Bson) -> bool {
    let (left, right) = (Comparable::from(field_value), Comparable::from(value));
    if left == right {
        return true;
    }

    match left {
        Comparable::Array(array) => array.iter().any(|item| item == &right),
        _ => false,
    }
}

fn contains(field_value: &Bson, value: &Bson) -> bool {
    match (Comparable::from(field_value), Comparable::from(value)) {
        (Comparable::Array(array), needle) => array.iter().any(|item| item == &needle),
        (Comparable::String(left), Comparable::String(right)) => left.contains(right),
        _ => false,
    }
}

/// `true` when the field value (or any element of it) equals the value (or any element of it).
fn intersects(field_value: &Bson, value: &Bson) -> bool {
    match (Comparable::from(field_value), Comparable::from(value)) {
        (Comparable::Array(array), Comparable::Array(values)) => {
            values.iter().any(|val| array.iter().any(|item| item == val))
        },
        (Comparable::Array(array), single_value) => {
            array.iter().any(|item| item == &single_value)
        },
        (single_value, Comparable::Array(values)) => {
            values.iter().any(|val| val == &single_value)
        },
        (left, right) => left == right,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use docshelf_core::query::Predicate;

    fn eval(document: &Document, expr: Expr) -> bool {
        DocumentEvaluator::new(document).evaluate(&expr).unwrap()
    }

    #[test]
    fn any_of_handles_scalar_and_array_fields() {
        let single = doc! { "_tenant": "a" };
        let many = doc! { "_tenant": ["b", "c"] };
        let none = doc! { "name": "x" };
        let tenants = vec![Bson::from("a"), Bson::from("c")];

        assert!(eval(&single, Predicate::any_of("_tenant", tenants.clone())));
        assert!(eval(&many, Predicate::any_of("_tenant", tenants.clone())));
        assert!(!eval(&none, Predicate::any_of("_tenant", tenants.clone())));
        assert!(!eval(&many, Predicate::any_of("_tenant", vec![Bson::from("a")])));
    }

    #[test]
    fn comparisons_and_logic() {
        let document = doc! { "age": 30, "name": "Alice", "tags": ["x", "y"] };

        assert!(eval(&document, Predicate::gte("age", 30_i64)));
        assert!(!eval(&document, Predicate::lt("age", 30.0)));
        assert!(eval(&document, Predicate::starts_with("name", "Al").and(Predicate::contains("tags", "y"))));
        assert!(eval(&document, Predicate::eq("name", "Bob").or(Predicate::exists("age"))));
        assert!(eval(&document, Predicate::ne("missing", 1)));
        assert!(!eval(&document, Predicate::eq("missing", 1)));
        assert!(eval(&document, Predicate::eq("age", 1).not()));
    }

    #[test]
    fn equality_on_array_fields_matches_any_element() {
        let document = doc! { "tags": ["x", "y"] };

        assert!(eval(&document, Predicate::eq("tags", "x")));
        assert!(eval(&document, Predicate::eq("tags", vec![Bson::from("x"), Bson::from("y")])));
        assert!(!eval(&document, Predicate::eq("tags", "z")));
        assert!(!eval(&document, Predicate::ne("tags", "y")));
        assert!(eval(&document, Predicate::ne("tags", "z")));
    }

    #[test]
    fn sorting_puts_missing_values_first() {
        let a = doc! { "n": 2 };
        let b = doc! { "n": 1 };
        let c = doc! {};
        let sort = [Sort::new("n", SortDirection::Asc)];

        let mut documents = vec![&a, &b, &c];
        documents.sort_by(|l, r| compare_documents(l, r, &sort));
        assert_eq!(documents, vec![&c, &b, &a]);

        let sort = [Sort::new("n", SortDirection::Desc)];
        documents.sort_by(|l, r| compare_documents(l, r, &sort));
        assert_eq!(documents, vec![&a, &b, &c]);
    }
}
