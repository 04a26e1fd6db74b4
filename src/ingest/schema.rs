//! Column schema, type inference and per-cell coercion.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Tokens treated as missing values in any column.
pub const NULL_TOKENS: [&str; 8] = ["", "null", "NULL", "N/A", "n/a", "NA", "nan", "NaN"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    Integer,
    Float,
    Boolean,
    Text,
}

impl ColumnType {
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Integer | Self::Float)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Text => "text",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub ty: ColumnType,
}

/// A coerced cell borrowed from the record it was parsed from.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Cell<'a> {
    Null,
    Number(f64),
    Bool(bool),
    Text(&'a str),
}

pub fn is_null_token(raw: &str) -> bool {
    NULL_TOKENS.contains(&raw)
}

pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "yes" => Some(true),
        "false" | "no" => Some(false),
        _ => None,
    }
}

/// Parses a finite number. Infinities are rejected so they cannot poison the moments.
pub fn parse_number(raw: &str) -> Option<f64> {
    raw.parse::<f64>().ok().filter(|v| v.is_finite())
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    columns: Vec<ColumnDef>,
}

impl Schema {
    pub fn new(columns: Vec<ColumnDef>) -> Self {
        Self { columns }
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Indices of numeric columns in schema order.
    pub fn numeric_indices(&self) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.ty.is_numeric())
            .map(|(i, _)| i)
            .collect()
    }

    /// Coerces raw fields into cells, or explains why the row does not fit.
    ///
    /// Numeric columns accept any finite number, so an integer column that
    /// later sees `2.5` still aggregates it.
    pub fn coerce<'a>(&self, fields: &[&'a str], out: &mut Vec<Cell<'a>>) -> Result<(), String> {
        out.clear();
        if fields.len() != self.columns.len() {
            return Err(format!(
                "expected {} fields, found {}",
                self.columns.len(),
                fields.len()
            ));
        }

        for (col, &raw) in self.columns.iter().zip(fields) {
            let raw = raw.trim();
            if is_null_token(raw) {
                out.push(Cell::Null);
                continue;
            }
            let cell = match col.ty {
                ColumnType::Integer | ColumnType::Float => match parse_number(raw) {
                    Some(v) => Cell::Number(v),
                    None => {
                        return Err(format!(
                            "column '{}': '{raw}' is not a {}",
                            col.name, col.ty
                        ));
                    }
                },
                ColumnType::Boolean => match parse_bool(raw) {
                    Some(b) => Cell::Bool(b),
                    None => {
                        return Err(format!("column '{}': '{raw}' is not a boolean", col.name));
                    }
                },
                ColumnType::Text => Cell::Text(raw),
            };
            out.push(cell);
        }
        Ok(())
    }
}

/// Widening type inference for a single column.
#[derive(Clone, Debug, Default)]
struct ColumnGuess {
    non_null: u64,
    integer: bool,
    float: bool,
    boolean: bool,
}

impl ColumnGuess {
    fn observe(&mut self, raw: &str) {
        let raw = raw.trim();
        if is_null_token(raw) {
            return;
        }
        if self.non_null == 0 {
            self.integer = true;
            self.float = true;
            self.boolean = true;
        }
        self.non_null += 1;
        if self.integer && raw.parse::<i64>().is_err() {
            self.integer = false;
        }
        if self.float && parse_number(raw).is_none() {
            self.float = false;
        }
        if self.boolean && parse_bool(raw).is_none() {
            self.boolean = false;
        }
    }

    fn finish(&self) -> ColumnType {
        if self.non_null == 0 {
            ColumnType::Text
        } else if self.integer {
            ColumnType::Integer
        } else if self.float {
            ColumnType::Float
        } else if self.boolean {
            ColumnType::Boolean
        } else {
            ColumnType::Text
        }
    }
}

/// Infers a schema from the rows of the first partition.
#[derive(Clone, Debug)]
pub struct SchemaInference {
    names: Vec<String>,
    guesses: Vec<ColumnGuess>,
}

impl SchemaInference {
    pub fn new(names: Vec<String>) -> Self {
        let guesses = vec![ColumnGuess::default(); names.len()];
        Self { names, guesses }
    }

    /// Rows whose width differs from the header are ignored here; they become
    /// row errors when the partition is read.
    pub fn observe(&mut self, fields: &[&str]) {
        if fields.len() != self.guesses.len() {
            return;
        }
        for (guess, raw) in self.guesses.iter_mut().zip(fields) {
            guess.observe(raw);
        }
    }

    pub fn finish(self) -> Schema {
        let columns = self
            .names
            .into_iter()
            .zip(self.guesses.iter())
            .map(|(name, guess)| ColumnDef {
                name,
                ty: guess.finish(),
            })
            .collect();
        Schema::new(columns)
    }
}
