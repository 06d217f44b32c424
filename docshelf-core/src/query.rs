//! Query, filter and predicate model for storage operations.
//!
//! This module provides three layers:
//!
//! - [`Expr`] - a backend-neutral predicate AST, built with [`Predicate`] and walked with
//!   [`QueryVisitor`] by each backend
//! - [`Filter`] - the selection handed to the storage contract, either a plain predicate
//!   or a predicate scoped to a set of tenants
//! - [`Query`] - pagination and sort parameters (`offset`, `limit`, `sort`)
//!
//! # Example
//!
//! ```ignore
//! use docshelf::query::{Filter, Predicate, Query, SortDirection};
//!
//! let filter = Filter::tenant(["acme"], Some(Predicate::eq("status", "active")));
//! let query = Query::builder()
//!     .limit(10)
//!     .offset(20)
//!     .sort("name", SortDirection::Asc)
//!     .build();
//! ```

use bson::{Bson, Document};

use crate::{
    document::{CREATED_AT_FIELD, TENANT_FIELD},
    error::{StorageError, StorageResult},
};

/// Number of documents returned when a query does not set a limit.
pub const DEFAULT_LIMIT: usize = 50;

/// Sort direction for query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    /// Ascending order (A to Z, 0 to 9, earliest to latest).
    Asc,
    /// Descending order (Z to A, 9 to 0, latest to earliest).
    Desc,
}

impl SortDirection {
    /// The numeric form used by serialized sort specifications (`1` or `-1`).
    pub fn as_i32(&self) -> i32 {
        match self {
            SortDirection::Asc => 1,
            SortDirection::Desc => -1,
        }
    }

    /// Reads a direction written as `1`/`-1` (integer or double) or `asc`/`desc`.
    pub fn from_bson(value: &Bson) -> Option<Self> {
        match value {
            Bson::Int32(1) | Bson::Int64(1) => Some(SortDirection::Asc),
            Bson::Int32(-1) | Bson::Int64(-1) => Some(SortDirection::Desc),
            Bson::Double(v) if *v == 1.0 => Some(SortDirection::Asc),
            Bson::Double(v) if *v == -1.0 => Some(SortDirection::Desc),
            Bson::String(s) => match s.to_ascii_lowercase().as_str() {
                "asc" | "ascending" => Some(SortDirection::Asc),
                "desc" | "descending" => Some(SortDirection::Desc),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Sort specification for query results.
///
/// Specifies which field to sort by and in which direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sort {
    /// The field name to sort by.
    pub field: String,
    /// The sort direction.
    pub direction: SortDirection,
}

impl Sort {
    pub fn new(field: impl Into<String>, direction: SortDirection) -> Self {
        Self { field: field.into(), direction }
    }
}

/// Field comparison operators for filter expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldOp {
    /// Equal to. On an array field, matches when the whole array or any element is equal.
    Eq,
    /// Negation of [`FieldOp::Eq`].
    Ne,
    /// Greater than.
    Gt,
    /// Greater than or equal to.
    Gte,
    /// Less than.
    Lt,
    /// Less than or equal to.
    Lte,
    /// String or array contains value.
    Contains,
    /// String or array does not contain value.
    NotContains,
    /// String starts with value.
    StartsWith,
    /// String ends with value.
    EndsWith,
    /// Field (or any element of an array field) equals any of the values.
    AnyOf,
    /// Field (or every element of an array field) equals none of the values.
    NoneOf,
}

/// A predicate expression for selecting documents.
///
/// Expressions can be combined using logical operators (`And`, `Or`, `Not`)
/// to build complex predicates.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Logical AND of multiple expressions (all must match).
    And(Vec<Expr>),
    /// Logical OR of multiple expressions (any must match).
    Or(Vec<Expr>),
    /// Logical NOT of an expression (inverts the result).
    Not(Box<Expr>),
    /// Checks if a field exists or doesn't exist.
    Exists(String, bool),
    /// Field comparison expression.
    Field {
        /// The field name to compare.
        field: String,
        /// The comparison operator.
        op: FieldOp,
        /// The value to compare against.
        value: Bson,
    },
}

impl Expr {
    /// Creates a field comparison expression.
    pub fn field(field: String, op: FieldOp, value: Bson) -> Self {
        Expr::Field { field, op, value }
    }

    /// Combines this expression with another using logical AND.
    ///
    /// If this expression is already an AND, the other expression is appended
    /// to the list. Otherwise, a new AND expression is created.
    pub fn and(self, other: Expr) -> Self {
        match self {
            Expr::And(mut list) => {
                list.push(other);
                Expr::And(list)
            }
            _ => Expr::And(vec![self, other]),
        }
    }

    /// Combines this expression with another using logical OR.
    pub fn or(self, other: Expr) -> Self {
        match self {
            Expr::Or(mut list) => {
                list.push(other);
                Expr::Or(list)
            }
            _ => Expr::Or(vec![self, other]),
        }
    }

    /// Negates this expression (logical NOT).
    pub fn not(self) -> Self {
        Expr::Not(Box::new(self))
    }
}

/// Helper for constructing predicate expressions.
///
/// All methods accept field names and values as `Into<String>` and `Into<Bson>`.
///
/// ```ignore
/// use docshelf::query::Predicate;
///
/// let expr = Predicate::eq("name", "Alice")
///     .and(Predicate::gt("age", 18));
/// ```
pub struct Predicate;

impl Predicate {
    /// Matches documents where the field equals the specified value.
    pub fn eq(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::Eq, value.into())
    }

    /// Matches documents where the field does not equal the specified value.
    pub fn ne(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::Ne, value.into())
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::Gt, value.into())
    }

    pub fn gte(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::Gte, value.into())
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::Lt, value.into())
    }

    pub fn lte(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::Lte, value.into())
    }

    /// Matches documents where the string field starts with the specified value.
    pub fn starts_with(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::StartsWith, value.into())
    }

    /// Matches documents where the string field ends with the specified value.
    pub fn ends_with(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::EndsWith, value.into())
    }

    /// Matches documents where the field (string or array) contains the specified value.
    pub fn contains(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::Contains, value.into())
    }

    pub fn not_contains(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::NotContains, value.into())
    }

    pub fn exists(field: impl Into<String>) -> Expr {
        Expr::Exists(field.into(), true)
    }

    pub fn not_exists(field: impl Into<String>) -> Expr {
        Expr::Exists(field.into(), false)
    }

    /// Combines multiple expressions such that all must match.
    pub fn and(exprs: impl IntoIterator<Item = Expr>) -> Expr {
        Expr::And(exprs.into_iter().collect())
    }

    /// Combines multiple expressions such that any can match.
    pub fn or(exprs: impl IntoIterator<Item = Expr>) -> Expr {
        Expr::Or(exprs.into_iter().collect())
    }

    /// Matches documents where the field, or any element of an array field,
    /// equals one of the specified values.
    pub fn any_of(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::AnyOf, value.into())
    }

    pub fn none_of(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::NoneOf, value.into())
    }
}

/// Selection of documents within a collection.
///
/// # Tenant scope
///
/// [`Filter::Tenant`] restricts matches to documents whose [`TENANT_FIELD`]
/// (a string or an array of strings) intersects `tenants`. An **empty** tenant
/// set applies no tenant restriction at all: every tenant's documents are
/// visible. Callers that need "no tenant visible" must not build an empty
/// tenant filter.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// An untyped predicate. `None` matches every document.
    Plain(Option<Expr>),
    /// A predicate scoped by a set of tenant identifiers.
    Tenant {
        predicate: Option<Expr>,
        tenants: Vec<String>,
    },
}

impl Default for Filter {
    fn default() -> Self {
        Filter::Plain(None)
    }
}

impl From<Expr> for Filter {
    fn from(expr: Expr) -> Self {
        Filter::Plain(Some(expr))
    }
}

impl Filter {
    /// A filter matching every document.
    pub fn all() -> Self {
        Filter::Plain(None)
    }

    /// A plain filter from a predicate expression.
    pub fn new(expr: Expr) -> Self {
        Filter::Plain(Some(expr))
    }

    /// A plain filter from a field -> expected value mapping.
    ///
    /// Every entry becomes an equality test and all of them must match.
    /// An empty mapping matches every document.
    pub fn from_document(document: &Document) -> Self {
        Filter::Plain(Self::equalities(document))
    }

    /// A tenant-scoped filter. See the type-level docs for empty tenant sets.
    pub fn tenant<I, S>(tenants: I, predicate: Option<Expr>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut tenants = tenants
            .into_iter()
            .map(Into::into)
            .collect::<Vec<String>>();
        tenants.sort();
        tenants.dedup();

        Filter::Tenant { predicate, tenants }
    }

    /// The caller-supplied predicate, without tenant scope.
    pub fn predicate(&self) -> Option<&Expr> {
        match self {
            Filter::Plain(predicate) | Filter::Tenant { predicate, .. } => predicate.as_ref(),
        }
    }

    /// The tenant set, or `None` for plain filters.
    pub fn tenants(&self) -> Option<&[String]> {
        match self {
            Filter::Plain(_) => None,
            Filter::Tenant { tenants, .. } => Some(tenants),
        }
    }

    /// Returns `true` if this filter restricts matches to a tenant set.
    pub fn is_tenant_restricted(&self) -> bool {
        self.tenants()
            .map(|tenants| !tenants.is_empty())
            .unwrap_or(false)
    }

    /// Resolves the filter into a single predicate, tenant scope included.
    ///
    /// Returns `None` when the filter matches every document.
    pub fn resolve(&self) -> Option<Expr> {
        let scope = match self {
            Filter::Tenant { tenants, .. } if !tenants.is_empty() => Some(Predicate::any_of(
                TENANT_FIELD,
                tenants
                    .iter()
                    .map(|t| Bson::String(t.clone()))
                    .collect::<Vec<_>>(),
            )),
            _ => None,
        };

        match (self.predicate().cloned(), scope) {
            (Some(predicate), Some(scope)) => Some(predicate.and(scope)),
            (Some(predicate), None) => Some(predicate),
            (None, scope) => scope,
        }
    }

    /// Resolves the filter and adds `extra` conditions in front of it.
    pub fn resolve_with(&self, extra: impl IntoIterator<Item = Expr>) -> Option<Expr> {
        let mut conditions = extra.into_iter().collect::<Vec<_>>();

        if let Some(expr) = self.resolve() {
            conditions.push(expr);
        }

        match conditions.len() {
            0 => None,
            1 => conditions.pop(),
            _ => Some(Expr::And(conditions)),
        }
    }

    fn equalities(document: &Document) -> Option<Expr> {
        let mut conditions = document
            .iter()
            .map(|(field, value)| Predicate::eq(field.as_str(), value.clone()))
            .collect::<Vec<_>>();

        match conditions.len() {
            0 => None,
            1 => conditions.pop(),
            _ => Some(Expr::And(conditions)),
        }
    }
}

/// Pagination and sort parameters for reads.
///
/// Unset values fall back to defaults: offset `0`, limit [`DEFAULT_LIMIT`],
/// sort newest first on the created-at field.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// Number of documents to skip.
    pub offset: usize,
    /// Maximum number of documents to return. Must be positive.
    pub limit: usize,
    /// Sort keys, applied in order.
    pub sort: Vec<Sort>,
}

impl Default for Query {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: DEFAULT_LIMIT,
            sort: Self::default_sort(),
        }
    }
}

impl Query {
    /// Creates a query with default parameters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new query builder for fluent construction.
    pub fn builder() -> QueryBuilder {
        QueryBuilder::new()
    }

    /// The default sort: newest first on the created-at field.
    pub fn default_sort() -> Vec<Sort> {
        vec![Sort::new(CREATED_AT_FIELD, SortDirection::Desc)]
    }

    /// Builds a query from optional raw parts.
    ///
    /// `sort` is a serialized key -> direction mapping such as `{"_cat": -1}`.
    /// Directions are `1`/`-1` or `"asc"`/`"desc"`. `None` or an empty
    /// string selects the default sort.
    pub fn from_parts(
        offset: Option<usize>,
        limit: Option<usize>,
        sort: Option<&str>,
    ) -> StorageResult<Self> {
        let mut builder = QueryBuilder::new();

        if let Some(offset) = offset {
            builder = builder.offset(offset);
        }
        if let Some(limit) = limit {
            builder = builder.limit(limit);
        }
        if let Some(sort) = sort.filter(|s| !s.trim().is_empty()) {
            builder = builder.sort_spec(Self::parse_sort(sort)?);
        }

        let query = builder.build();
        query.validate()?;

        Ok(query)
    }

    /// Parses a serialized key -> direction mapping, keeping key order.
    pub fn parse_sort(raw: &str) -> StorageResult<Vec<Sort>> {
        let spec: Document = serde_json::from_str(raw)
            .map_err(|e| StorageError::InvalidQuery(format!("sort is not a JSON object: {e}")))?;

        spec.iter()
            .map(|(field, direction)| {
                SortDirection::from_bson(direction)
                    .map(|direction| Sort::new(field.as_str(), direction))
                    .ok_or_else(|| StorageError::InvalidQuery(format!(
                        "invalid sort direction {direction} for field {field}"
                    )))
            })
            .collect()
    }

    /// Serializes the sort keys into a key -> direction mapping.
    pub fn sort_document(&self) -> Document {
        self.sort
            .iter()
            .map(|sort| (sort.field.clone(), Bson::Int32(sort.direction.as_i32())))
            .collect()
    }

    /// Checks the invariants: the limit is positive.
    pub fn validate(&self) -> StorageResult<()> {
        if self.limit == 0 {
            return Err(StorageError::InvalidQuery("limit must be a positive integer".into()));
        }

        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct QueryBuilder {
    offset: Option<usize>,
    limit: Option<usize>,
    sort: Vec<Sort>,
}

impl QueryBuilder {
    /// Creates a new query builder.
    pub fn new() -> Self {
        QueryBuilder {
            offset: None,
            limit: None,
            sort: Vec::new(),
        }
    }

    /// Sets the maximum number of documents to return.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sets the number of documents to skip (for pagination).
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Adds a sort key. Keys are applied in the order they are added.
    pub fn sort(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort.push(Sort::new(field, direction));
        self
    }

    /// Replaces the sort keys.
    pub fn sort_spec(mut self, sort: Vec<Sort>) -> Self {
        self.sort = sort;
        self
    }

    /// Builds and returns the final query, filling in defaults.
    pub fn build(self) -> Query {
        Query {
            offset: self.offset.unwrap_or(0),
            limit: self.limit.unwrap_or(DEFAULT_LIMIT),
            sort: if self.sort.is_empty() {
                Query::default_sort()
            } else {
                self.sort
            },
        }
    }
}

impl Default for QueryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub trait QueryVisitor {
    type Output;
    type Error: Into<StorageError>;

    fn visit_and(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error>;
    fn visit_or(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error>;
    fn visit_not(&mut self, expr: &Expr) -> Result<Self::Output, Self::Error>;
    fn visit_exists(
        &mut self,
        field: &str,
        should_exist: bool,
    ) -> Result<Self::Output, Self::Error>;
    fn visit_field(
        &mut self,
        field: &str,
        op: &FieldOp,
        value: &Bson,
    ) -> Result<Self::Output, Self::Error>;

    fn visit_expr(&mut self, expr: &Expr) -> Result<Self::Output, Self::Error> {
        match expr {
            Expr::And(exprs) => self.visit_and(exprs),
            Expr::Or(exprs) => self.visit_or(exprs),
            Expr::Not(expr) => self.visit_not(expr),
            Expr::Exists(field, should_exist) => self.visit_exists(field, *should_exist),
            Expr::Field { field, op, value } => self.visit_field(field, op, value),
        }
    }
}
