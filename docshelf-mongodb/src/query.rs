//! Query translation from predicate expressions to MongoDB query syntax.
//!
//! This module translates [`Expr`] trees into MongoDB BSON filter documents
//! for execution by the MongoDB query engine.

use bson::{Document, Bson, doc};

use docshelf_core::{
    query::{QueryVisitor, Expr, FieldOp, Sort, SortDirection},
    error::StorageError,
};

use crate::sanitizer::KeySanitizer;


/// Translates predicate expressions into MongoDB query documents.
///
/// Field names go through [`KeySanitizer`] so they line up with stored keys.
pub(crate) struct MongoQueryTranslator;

impl MongoQueryTranslator {
    /// Translates `filter`, matching every document when `None`.
    pub(crate) fn translate(filter: Option<&Expr>) -> Result<Document, StorageError> {
        match filter {
            Some(expr) => MongoQueryTranslator.visit_expr(expr),
            None => Ok(doc! {}),
        }
    }

    /// Builds a `sort` document preserving key order.
    pub(crate) fn sort(sort: &[Sort]) -> Document {
        sort.iter()
            .map(|key| (
                KeySanitizer::sanitize_key(&key.field),
                Bson::Int32(match key.direction {
                    SortDirection::Asc => 1,
                    SortDirection::Desc => -1,
                }),
            ))
            .collect()
    }
}

/// Escapes regex metacharacters so a value matches literally.
fn escape_regex(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        if "\\^$.|?*+()[]{}".contains(c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn as_list(value: &Bson) -> Bson {
    match value {
        Bson::Array(_) => value.clone(),
        other => Bson::Array(vec![other.clone()]),
    }
}

impl QueryVisitor for MongoQueryTranslator {
    type Output = Document;
    type Error = StorageError;

    fn visit_and(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error> {
        Ok(doc! {
            "$and": exprs
                .iter()
                .map(|expr| self.visit_expr(expr))
                .collect::<Result<Vec<_>, _>>()?,
        })
    }

    fn visit_or(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error> {
        Ok(doc! {
            "$or": exprs
                .iter()
                .map(|expr| self.visit_expr(expr))
                .collect::<Result<Vec<_>, _>>()?,
        })
    }

    // `$not` is only valid inside a field clause; `$nor` negates a whole expression.
    fn visit_not(&mut self, expr: &Expr) -> Result<Self::Output, Self::Error> {
        Ok(doc! {
            "$nor": [self.visit_expr(expr)?],
        })
    }

    fn visit_exists(&mut self, field: &str, should_exist: bool) -> Result<Self::Output, Self::Error> {
        Ok(doc! {
            KeySanitizer::sanitize_key(field): { "$exists": should_exist },
        })
    }

    fn visit_field(&mut self, field: &str, op: &FieldOp, value: &Bson) -> Result<Self::Output, Self::Error> {
        Ok(doc! {
            KeySanitizer::sanitize_key(field): match op {
                FieldOp::Eq => doc! { "$eq": value },
                FieldOp::Ne => doc! { "$ne": value },
                FieldOp::Gt => doc! { "$gt": value },
                FieldOp::Gte => doc! { "$gte": value },
                FieldOp::Lt => doc! { "$lt": value },
                FieldOp::Lte => doc! { "$lte": value },
                FieldOp::Contains => match value {
                    Bson::String(s) => doc! { "$regex": escape_regex(s) },
                    Bson::Array(arr) => doc! { "$all": arr },
                    other => doc! { "$elemMatch": { "$eq": other } },
                },
                FieldOp::NotContains => match value {
                    Bson::String(s) => doc! { "$not": { "$regex": escape_regex(s) } },
                    Bson::Array(arr) => doc! { "$nin": arr },
                    other => doc! { "$ne": other },
                },
                FieldOp::StartsWith => match value {
                    Bson::String(s) => doc! { "$regex": format!("^{}", escape_regex(s)) },
                    _ => return Err(StorageError::InvalidQuery("StartsWith operator requires a string value".to_string())),
                },
                FieldOp::EndsWith => match value {
                    Bson::String(s) => doc! { "$regex": format!("{}$", escape_regex(s)) },
                    _ => return Err(StorageError::InvalidQuery("EndsWith operator requires a string value".to_string())),
                },
                FieldOp::AnyOf => doc! { "$in": as_list(value) },
                FieldOp::NoneOf => doc! { "$nin": as_list(value) },
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docshelf_core::query::{Filter, Predicate};

    #[test]
    fn tenant_filter_becomes_in_clause() {
        let filter = Filter::tenant(["b", "a"], Some(Predicate::eq("name", "x")));
        let translated = MongoQueryTranslator::translate(filter.resolve().as_ref()).unwrap();

        assert_eq!(translated, doc! {
            "$and": [
                { "name": { "$eq": "x" } },
                { "_tenant": { "$in": ["a", "b"] } },
            ]
        });
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert_eq!(MongoQueryTranslator::translate(None).unwrap(), doc! {});
    }

    #[test]
    fn negation_and_literal_regexes() {
        let expr = Predicate::starts_with("a.b", "1+1").not();

        assert_eq!(MongoQueryTranslator::translate(Some(&expr)).unwrap(), doc! {
            "$nor": [{ "a__dot__b": { "$regex": "^1\\+1" } }]
        });
        assert!(MongoQueryTranslator::translate(Some(&Predicate::ends_with("n", 3))).is_err());
    }

    #[test]
    fn sort_keeps_key_order() {
        let sort = [Sort::new("_cat", SortDirection::Desc), Sort::new("_id", SortDirection::Asc)];
        let document = MongoQueryTranslator::sort(&sort);

        assert_eq!(document.keys().collect::<Vec<_>>(), vec!["_cat", "_id"]);
        assert_eq!(document, doc! { "_cat": -1, "_id": 1 });
    }
}
