use std::collections::BTreeMap;
use std::ops::Range;
use thiserror::Error;
use tracing::trace;

/// well known ledger columns, managed by the ledger itself
pub const GIVEN: &str = "given";
pub const RETURNED: &str = "returned";
pub const CANCEL_REQUESTED: &str = "cancel_requested";

/// well known heuristic columns, created with every ledger
pub const LOCAL_PT: &str = "local_pt";
pub const NUM_ACTIVE_RUNS: &str = "num_active_runs";
pub const DIST_TO_BETTER_L: &str = "dist_to_better_l";
pub const DIST_TO_BETTER_S: &str = "dist_to_better_s";
pub const IND_OF_BETTER_L: &str = "ind_of_better_l";
pub const IND_OF_BETTER_S: &str = "ind_of_better_s";

/// conventional names for the point columns declared by generator policies
pub const X: &str = "x";
pub const X_ON_CUBE: &str = "x_on_cube";

/// sentinel for "no better point known yet"
pub const NO_BETTER_POINT: i64 = -1;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("row {0} is not an assigned ledger index")]
    InvalidIndex(usize),
    #[error("field '{field}' of row {row} is finalized and cannot be overwritten")]
    ImmutableField { field: String, row: usize },
    #[error("field '{0}' is not declared in the campaign schema")]
    UnknownField(String),
    #[error("field '{0}' is managed by the ledger")]
    ProtectedField(String),
    #[error("field '{0}' is declared more than once")]
    DuplicateField(String),
    #[error("values for '{0}' do not match the declared shape")]
    ShapeMismatch(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    Bool,
    Int,
    Float,
    /// fixed dimension per row, flattened row-major
    FloatVec(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRole {
    /// set when the point is requested, frozen once the row is returned
    Input,
    /// produced by a simulation, written when results come back
    Output,
    /// scheduling and search bookkeeping, always writable
    Bookkeeping,
}

#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub role: FieldRole,
}

impl FieldSpec {
    pub fn input(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            role: FieldRole::Input,
        }
    }

    pub fn output(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            role: FieldRole::Output,
        }
    }

    fn bookkeeping(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            role: FieldRole::Bookkeeping,
        }
    }
}

/// One typed column of the ledger or of a transmitted frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Bool(Vec<bool>),
    Int(Vec<i64>),
    Float(Vec<f64>),
    FloatVec { dim: usize, data: Vec<f64> },
}

impl Column {
    pub fn empty(kind: &FieldKind) -> Self {
        match kind {
            FieldKind::Bool => Self::Bool(Vec::new()),
            FieldKind::Int => Self::Int(Vec::new()),
            FieldKind::Float => Self::Float(Vec::new()),
            FieldKind::FloatVec(dim) => Self::FloatVec {
                dim: *dim,
                data: Vec::new(),
            },
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Bool(v) => v.len(),
            Self::Int(v) => v.len(),
            Self::Float(v) => v.len(),
            Self::FloatVec { dim, data } => data.len() / dim,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn kind_matches(&self, kind: &FieldKind) -> bool {
        matches!(
            (self, kind),
            (Self::Bool(_), FieldKind::Bool)
                | (Self::Int(_), FieldKind::Int)
                | (Self::Float(_), FieldKind::Float)
        ) || matches!((self, kind), (Self::FloatVec { dim, .. }, FieldKind::FloatVec(d)) if dim == d)
    }

    fn push_defaults(&mut self, n: usize) {
        match self {
            Self::Bool(v) => v.resize(v.len() + n, false),
            Self::Int(v) => v.resize(v.len() + n, 0),
            Self::Float(v) => v.resize(v.len() + n, 0.0),
            Self::FloatVec { dim, data } => data.resize(data.len() + n * *dim, 0.0),
        }
    }

    /// accessors panic on a kind mismatch or an out of range row, both of
    /// which are ruled out by schema validation before any access
    pub fn flag(&self, row: usize) -> bool {
        match self {
            Self::Bool(v) => v[row],
            _ => panic!("column is not boolean"),
        }
    }

    pub fn int(&self, row: usize) -> i64 {
        match self {
            Self::Int(v) => v[row],
            _ => panic!("column is not integer"),
        }
    }

    pub fn float(&self, row: usize) -> f64 {
        match self {
            Self::Float(v) => v[row],
            _ => panic!("column is not float"),
        }
    }

    pub fn vec(&self, row: usize) -> &[f64] {
        match self {
            Self::FloatVec { dim, data } => &data[row * dim..(row + 1) * dim],
            _ => panic!("column is not a float vector"),
        }
    }

    pub fn set_flag(&mut self, row: usize, value: bool) {
        match self {
            Self::Bool(v) => v[row] = value,
            _ => panic!("column is not boolean"),
        }
    }

    pub fn set_int(&mut self, row: usize, value: i64) {
        match self {
            Self::Int(v) => v[row] = value,
            _ => panic!("column is not integer"),
        }
    }

    pub fn set_float(&mut self, row: usize, value: f64) {
        match self {
            Self::Float(v) => v[row] = value,
            _ => panic!("column is not float"),
        }
    }

    pub fn set_vec(&mut self, row: usize, value: &[f64]) {
        match self {
            Self::FloatVec { dim, data } => {
                data[row * *dim..(row + 1) * *dim].copy_from_slice(value)
            }
            _ => panic!("column is not a float vector"),
        }
    }

    fn copy_row(&mut self, dst: usize, src: &Column, src_row: usize) {
        match (self, src) {
            (Self::Bool(d), Self::Bool(s)) => d[dst] = s[src_row],
            (Self::Int(d), Self::Int(s)) => d[dst] = s[src_row],
            (Self::Float(d), Self::Float(s)) => d[dst] = s[src_row],
            (Self::FloatVec { dim, data }, Self::FloatVec { data: s, .. }) => {
                data[dst * *dim..(dst + 1) * *dim].copy_from_slice(&s[src_row * *dim..(src_row + 1) * *dim])
            }
            _ => panic!("column kinds diverged after validation"),
        }
    }

    /// copy of the selected rows, in the given order
    pub fn gather(&self, rows: &[usize]) -> Column {
        match self {
            Self::Bool(v) => Self::Bool(rows.iter().map(|&r| v[r]).collect()),
            Self::Int(v) => Self::Int(rows.iter().map(|&r| v[r]).collect()),
            Self::Float(v) => Self::Float(rows.iter().map(|&r| v[r]).collect()),
            Self::FloatVec { dim, data } => Self::FloatVec {
                dim: *dim,
                data: rows
                    .iter()
                    .flat_map(|&r| data[r * dim..(r + 1) * dim].iter().copied())
                    .collect(),
            },
        }
    }
}

/// A small record batch transmitted between manager and workers. Shares the
/// ledger's column representation but carries no roles or flags.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    len: usize,
    columns: BTreeMap<String, Column>,
}

impl Frame {
    pub fn new(len: usize) -> Self {
        Self {
            len,
            columns: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, name: impl Into<String>, column: Column) -> Result<(), HistoryError> {
        let name = name.into();
        if column.len() != self.len {
            return Err(HistoryError::ShapeMismatch(name));
        }
        if self.columns.insert(name.clone(), column).is_some() {
            return Err(HistoryError::DuplicateField(name));
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Column> {
        self.columns.get(name)
    }

    pub fn column(&self, name: &str) -> Result<&Column, HistoryError> {
        self.columns
            .get(name)
            .ok_or_else(|| HistoryError::UnknownField(name.to_owned()))
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Column)> {
        self.columns.iter().map(|(name, col)| (name.as_str(), col))
    }

    /// sub frame with the selected rows, in the given order
    pub fn select(&self, rows: &[usize]) -> Frame {
        Frame {
            len: rows.len(),
            columns: self
                .columns
                .iter()
                .map(|(name, col)| (name.clone(), col.gather(rows)))
                .collect(),
        }
    }
}

/// Campaign schema, resolved once at ledger construction. The ledger always
/// carries its own bookkeeping and heuristic columns; the campaign adds the
/// point and result columns on top and cannot shadow the built in set.
#[derive(Debug, Clone)]
pub struct Schema {
    fields: Vec<FieldSpec>,
}

fn reserved_fields() -> Vec<FieldSpec> {
    vec![
        FieldSpec::bookkeeping(GIVEN, FieldKind::Bool),
        FieldSpec::bookkeeping(RETURNED, FieldKind::Bool),
        FieldSpec::bookkeeping(CANCEL_REQUESTED, FieldKind::Bool),
        FieldSpec::input(LOCAL_PT, FieldKind::Bool),
        FieldSpec::bookkeeping(NUM_ACTIVE_RUNS, FieldKind::Int),
        FieldSpec::bookkeeping(DIST_TO_BETTER_L, FieldKind::Float),
        FieldSpec::bookkeeping(DIST_TO_BETTER_S, FieldKind::Float),
        FieldSpec::bookkeeping(IND_OF_BETTER_L, FieldKind::Int),
        FieldSpec::bookkeeping(IND_OF_BETTER_S, FieldKind::Int),
    ]
}

impl Schema {
    pub fn build(campaign: impl IntoIterator<Item = FieldSpec>) -> Result<Self, HistoryError> {
        let mut fields = reserved_fields();
        let managed = fields.len();

        for spec in campaign {
            if fields[..managed].iter().any(|f| f.name == spec.name) {
                return Err(HistoryError::ProtectedField(spec.name));
            }
            if fields[managed..].iter().any(|f| f.name == spec.name) {
                return Err(HistoryError::DuplicateField(spec.name));
            }
            if matches!(spec.kind, FieldKind::FloatVec(0)) {
                return Err(HistoryError::ShapeMismatch(spec.name));
            }
            fields.push(spec);
        }

        Ok(Self { fields })
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn spec(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.spec(name).is_some()
    }
}

/// The append only record of every point ever requested. Owned and mutated
/// exclusively by the manager; workers only ever see frames copied out of it.
#[derive(Debug)]
pub struct History {
    schema: Schema,
    len: usize,
    returned_count: usize,
    columns: BTreeMap<String, Column>,
}

impl History {
    pub fn new(schema: Schema) -> Self {
        let columns = schema
            .fields()
            .iter()
            .map(|f| (f.name.clone(), Column::empty(&f.kind)))
            .collect();

        Self {
            schema,
            len: 0,
            returned_count: 0,
            columns,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// number of rows with results written back so far
    pub fn returned_count(&self) -> usize {
        self.returned_count
    }

    /// Grow the ledger by `n` rows and return their indices. Existing indices
    /// are never moved or reused.
    pub fn append_rows(&mut self, n: usize) -> Range<usize> {
        let start = self.len;
        for (name, column) in self.columns.iter_mut() {
            column.push_defaults(n);
            match name.as_str() {
                DIST_TO_BETTER_L | DIST_TO_BETTER_S => {
                    for row in start..start + n {
                        column.set_float(row, f64::INFINITY);
                    }
                }
                IND_OF_BETTER_L | IND_OF_BETTER_S => {
                    for row in start..start + n {
                        column.set_int(row, NO_BETTER_POINT);
                    }
                }
                _ => {}
            }
        }
        self.len += n;

        trace!(rows = n, len = self.len, "grew ledger");

        start..self.len
    }

    fn check_rows(&self, rows: &[usize]) -> Result<(), HistoryError> {
        match rows.iter().find(|&&r| r >= self.len) {
            Some(&bad) => Err(HistoryError::InvalidIndex(bad)),
            None => Ok(()),
        }
    }

    /// Copy the requested fields of the requested rows out into a frame.
    pub fn read(&self, rows: &[usize], fields: &[&str]) -> Result<Frame, HistoryError> {
        self.check_rows(rows)?;

        let mut frame = Frame::new(rows.len());
        for &name in fields {
            let column = self
                .columns
                .get(name)
                .ok_or_else(|| HistoryError::UnknownField(name.to_owned()))?;
            frame.insert(name, column.gather(rows))?;
        }

        Ok(frame)
    }

    /// Write a frame back into the given rows, one frame row per ledger row.
    /// Validation runs over the whole frame before any column is touched, so
    /// a failed write leaves the ledger untouched.
    pub fn write(&mut self, rows: &[usize], frame: &Frame) -> Result<(), HistoryError> {
        self.check_rows(rows)?;
        if frame.len() != rows.len() {
            return Err(HistoryError::ShapeMismatch("frame".to_owned()));
        }

        for (name, column) in frame.fields() {
            if matches!(name, GIVEN | RETURNED | CANCEL_REQUESTED) {
                return Err(HistoryError::ProtectedField(name.to_owned()));
            }
            let spec = self
                .schema
                .spec(name)
                .ok_or_else(|| HistoryError::UnknownField(name.to_owned()))?;
            if !column.kind_matches(&spec.kind) {
                return Err(HistoryError::ShapeMismatch(name.to_owned()));
            }
            if spec.role == FieldRole::Input {
                if let Some(&row) = rows.iter().find(|&&r| self.returned(r)) {
                    return Err(HistoryError::ImmutableField {
                        field: name.to_owned(),
                        row,
                    });
                }
            }
        }

        for (name, column) in frame.fields() {
            let dst = self.columns.get_mut(name).unwrap();
            for (i, &row) in rows.iter().enumerate() {
                dst.copy_row(row, column, i);
            }
        }

        Ok(())
    }

    pub fn column(&self, name: &str) -> Result<&Column, HistoryError> {
        self.columns
            .get(name)
            .ok_or_else(|| HistoryError::UnknownField(name.to_owned()))
    }

    fn set_flags(&mut self, name: &str, rows: &[usize], value: bool) -> Result<(), HistoryError> {
        self.check_rows(rows)?;
        let column = self.columns.get_mut(name).unwrap();
        for &row in rows {
            column.set_flag(row, value);
        }
        Ok(())
    }

    /// `given` only ever transitions to true
    pub fn mark_given(&mut self, rows: &[usize]) -> Result<(), HistoryError> {
        self.set_flags(GIVEN, rows, true)
    }

    /// Writing the returned flag is the only way a row becomes visible to
    /// downstream consumers such as the nearest better bookkeeping.
    pub fn mark_returned(&mut self, rows: &[usize]) -> Result<(), HistoryError> {
        self.check_rows(rows)?;
        let column = self.columns.get_mut(RETURNED).unwrap();
        for &row in rows {
            if !column.flag(row) {
                column.set_flag(row, true);
                self.returned_count += 1;
            }
        }
        Ok(())
    }

    pub fn request_cancel(&mut self, rows: &[usize]) -> Result<(), HistoryError> {
        self.set_flags(CANCEL_REQUESTED, rows, true)
    }

    pub fn given(&self, row: usize) -> bool {
        self.columns[GIVEN].flag(row)
    }

    pub fn returned(&self, row: usize) -> bool {
        self.columns[RETURNED].flag(row)
    }

    pub fn cancel_requested(&self, row: usize) -> bool {
        self.columns[CANCEL_REQUESTED].flag(row)
    }

    /// Refresh the nearest better distances around a freshly returned row:
    /// the new row scans all previously returned points for its own nearest
    /// betters, and rows the new point improves on have their entries pulled
    /// in. Distances are measured on the unit cube, local and sample points
    /// bucketed separately.
    pub fn update_nearest_better(&mut self, row: usize, objective: &str) -> Result<(), HistoryError> {
        self.check_rows(&[row])?;

        let obj = self.column(objective)?;
        let cube = self.column(X_ON_CUBE)?;
        let returned = &self.columns[RETURNED];
        let local = &self.columns[LOCAL_PT];

        let f_new = obj.float(row);
        let x_new = cube.vec(row);
        let new_is_local = local.flag(row);

        let mut best_l: Option<(f64, usize)> = None;
        let mut best_s: Option<(f64, usize)> = None;
        let mut pulled: Vec<(usize, f64)> = Vec::new();

        for other in 0..self.len {
            if other == row || !returned.flag(other) {
                continue;
            }
            let dist = x_new
                .iter()
                .zip(cube.vec(other))
                .map(|(a, b)| (a - b) * (a - b))
                .sum::<f64>()
                .sqrt();
            let f_other = obj.float(other);

            if f_other < f_new {
                let slot = if local.flag(other) { &mut best_l } else { &mut best_s };
                if slot.map_or(true, |(d, _)| dist < d) {
                    *slot = Some((dist, other));
                }
            }
            if f_new < f_other {
                let field = if new_is_local { DIST_TO_BETTER_L } else { DIST_TO_BETTER_S };
                if dist < self.columns[field].float(other) {
                    pulled.push((other, dist));
                }
            }
        }

        if let Some((dist, ind)) = best_l {
            if dist < self.columns[DIST_TO_BETTER_L].float(row) {
                self.columns.get_mut(DIST_TO_BETTER_L).unwrap().set_float(row, dist);
                self.columns.get_mut(IND_OF_BETTER_L).unwrap().set_int(row, ind as i64);
            }
        }
        if let Some((dist, ind)) = best_s {
            if dist < self.columns[DIST_TO_BETTER_S].float(row) {
                self.columns.get_mut(DIST_TO_BETTER_S).unwrap().set_float(row, dist);
                self.columns.get_mut(IND_OF_BETTER_S).unwrap().set_int(row, ind as i64);
            }
        }
        let (dist_field, ind_field) = if new_is_local {
            (DIST_TO_BETTER_L, IND_OF_BETTER_L)
        } else {
            (DIST_TO_BETTER_S, IND_OF_BETTER_S)
        };
        for (other, dist) in pulled {
            self.columns.get_mut(dist_field).unwrap().set_float(other, dist);
            self.columns.get_mut(ind_field).unwrap().set_int(other, row as i64);
        }

        Ok(())
    }
}
