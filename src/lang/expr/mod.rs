use std::collections::HashMap;
use std::fmt;
use std::ops::{Add, Mul, Sub};

use anyhow::{Error, Result};

use crate::pipeline::SchedulingError;

/// Values for the free symbols of an expression (kernel parameters, launch coordinates).
pub type Bindings = HashMap<String, u64>;

/// Integer expression used for loop trip counts. Trip counts may depend on launch
/// coordinates (causal masking), so they are kept symbolic until the kernel runs.
/// Arithmetic is over naturals, subtraction saturates at zero.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Expr {
    Const(u64),
    Sym(String),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    CeilDiv(Box<Expr>, Box<Expr>),
    Min(Box<Expr>, Box<Expr>),
    Max(Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn sym(name: impl Into<String>) -> Self {
        Expr::Sym(name.into())
    }

    pub fn ceildiv(a: impl Into<Expr>, b: impl Into<Expr>) -> Self {
        Expr::CeilDiv(Box::new(a.into()), Box::new(b.into()))
    }

    pub fn min(a: impl Into<Expr>, b: impl Into<Expr>) -> Self {
        Expr::Min(Box::new(a.into()), Box::new(b.into()))
    }

    pub fn max(a: impl Into<Expr>, b: impl Into<Expr>) -> Self {
        Expr::Max(Box::new(a.into()), Box::new(b.into()))
    }

    pub fn as_const(&self) -> Option<u64> {
        match self.fold() {
            Expr::Const(c) => Some(c),
            _ => None,
        }
    }

    pub fn is_const(&self) -> bool {
        self.as_const().is_some()
    }

    /// Free symbols in first-occurrence order.
    pub fn symbols(&self) -> Vec<&str> {
        let mut out = vec![];
        self.collect_symbols(&mut out);
        out
    }

    fn collect_symbols<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Const(_) => {}
            Expr::Sym(name) => {
                if !out.contains(&name.as_str()) {
                    out.push(name);
                }
            }
            Expr::Add(a, b)
            | Expr::Sub(a, b)
            | Expr::Mul(a, b)
            | Expr::CeilDiv(a, b)
            | Expr::Min(a, b)
            | Expr::Max(a, b) => {
                a.collect_symbols(out);
                b.collect_symbols(out);
            }
        }
    }

    /// Constant folding. Sub-expressions that do not fold are kept as they are,
    /// a division by a constant zero is left unfolded so `eval` can report it.
    pub fn fold(&self) -> Expr {
        let binary = |a: &Expr, b: &Expr, f: fn(u64, u64) -> Option<u64>, make: fn(Box<Expr>, Box<Expr>) -> Expr| {
            let (a, b) = (a.fold(), b.fold());
            if let (Expr::Const(x), Expr::Const(y)) = (&a, &b) {
                if let Some(v) = f(*x, *y) {
                    return Expr::Const(v);
                }
            }
            make(Box::new(a), Box::new(b))
        };
        match self {
            Expr::Const(_) | Expr::Sym(_) => self.clone(),
            Expr::Add(a, b) => binary(a, b, |x, y| x.checked_add(y), Expr::Add),
            Expr::Sub(a, b) => binary(a, b, |x, y| Some(x.saturating_sub(y)), Expr::Sub),
            Expr::Mul(a, b) => binary(a, b, |x, y| x.checked_mul(y), Expr::Mul),
            Expr::CeilDiv(a, b) => binary(a, b, ceil_div, Expr::CeilDiv),
            Expr::Min(a, b) => binary(a, b, |x, y| Some(x.min(y)), Expr::Min),
            Expr::Max(a, b) => binary(a, b, |x, y| Some(x.max(y)), Expr::Max),
        }
    }

    pub fn eval(&self, bindings: &Bindings) -> Result<u64, SchedulingError> {
        let overflow = || SchedulingError::InvalidDeclaration(format!("trip count `{}` overflows", self));
        Ok(match self {
            Expr::Const(c) => *c,
            Expr::Sym(name) => *bindings
                .get(name)
                .ok_or_else(|| SchedulingError::UnboundSymbol(name.clone()))?,
            Expr::Add(a, b) => a.eval(bindings)?.checked_add(b.eval(bindings)?).ok_or_else(overflow)?,
            Expr::Sub(a, b) => a.eval(bindings)?.saturating_sub(b.eval(bindings)?),
            Expr::Mul(a, b) => a.eval(bindings)?.checked_mul(b.eval(bindings)?).ok_or_else(overflow)?,
            Expr::CeilDiv(a, b) => {
                let (x, y) = (a.eval(bindings)?, b.eval(bindings)?);
                ceil_div(x, y).ok_or_else(|| {
                    SchedulingError::InvalidDeclaration(format!("division by zero in `{}`", self))
                })?
            }
            Expr::Min(a, b) => a.eval(bindings)?.min(b.eval(bindings)?),
            Expr::Max(a, b) => a.eval(bindings)?.max(b.eval(bindings)?),
        })
    }
}

fn ceil_div(x: u64, y: u64) -> Option<u64> {
    if y == 0 {
        None
    } else {
        Some(x / y + u64::from(x % y != 0))
    }
}

impl From<u64> for Expr {
    fn from(value: u64) -> Self {
        Expr::Const(value)
    }
}

impl From<u32> for Expr {
    fn from(value: u32) -> Self {
        Expr::Const(value as u64)
    }
}

impl From<usize> for Expr {
    fn from(value: usize) -> Self {
        Expr::Const(value as u64)
    }
}

impl From<&str> for Expr {
    fn from(value: &str) -> Self {
        Expr::sym(value)
    }
}

impl From<&Expr> for Expr {
    fn from(value: &Expr) -> Self {
        value.clone()
    }
}

impl<T: Into<Expr>> Add<T> for Expr {
    type Output = Expr;

    fn add(self, rhs: T) -> Expr {
        Expr::Add(Box::new(self), Box::new(rhs.into()))
    }
}

impl<T: Into<Expr>> Sub<T> for Expr {
    type Output = Expr;

    fn sub(self, rhs: T) -> Expr {
        Expr::Sub(Box::new(self), Box::new(rhs.into()))
    }
}

impl<T: Into<Expr>> Mul<T> for Expr {
    type Output = Expr;

    fn mul(self, rhs: T) -> Expr {
        Expr::Mul(Box::new(self), Box::new(rhs.into()))
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Const(c) => write!(f, "{}", c),
            Expr::Sym(name) => write!(f, "{}", name),
            Expr::Add(a, b) => write!(f, "({} + {})", a, b),
            Expr::Sub(a, b) => write!(f, "({} - {})", a, b),
            Expr::Mul(a, b) => write!(f, "{} * {}", a, b),
            Expr::CeilDiv(a, b) => write!(f, "ceildiv({}, {})", a, b),
            Expr::Min(a, b) => write!(f, "min({}, {})", a, b),
            Expr::Max(a, b) => write!(f, "max({}, {})", a, b),
        }
    }
}

const BLOCK_IDX: [&str; 3] = ["bx", "by", "bz"];

/// Grid and thread extents of a kernel launch. The scheduler only needs the names of the
/// block coordinates so that trip counts can mention them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchFrame {
    grid: Vec<Expr>,
    threads: [u32; 3],
}

impl LaunchFrame {
    /// `threads` is blockDim.(x|y|z); missing dimensions are padded with 1.
    pub fn new(grid: Vec<Expr>, threads: &[u32]) -> Result<Self> {
        if grid.is_empty() || grid.len() > 3 {
            return Err(Error::msg(format!(
                "grid must have between 1 and 3 dimensions, got {}",
                grid.len()
            )));
        }
        if threads.is_empty() || threads.len() > 3 {
            return Err(Error::msg(format!(
                "threads must have between 1 and 3 dimensions, got {:?}",
                threads
            )));
        }
        if threads.iter().any(|t| *t == 0) {
            return Err(Error::msg(format!("thread extents must be positive, got {:?}", threads)));
        }
        let mut padded = [1; 3];
        padded[..threads.len()].copy_from_slice(threads);
        Ok(LaunchFrame { grid, threads: padded })
    }

    pub fn grid(&self) -> &[Expr] {
        &self.grid
    }

    pub fn threads(&self) -> [u32; 3] {
        self.threads
    }

    pub fn num_threads(&self) -> u32 {
        self.threads.iter().product()
    }

    /// Block coordinate symbols, one per grid dimension.
    pub fn block_idx(&self) -> Vec<Expr> {
        BLOCK_IDX[..self.grid.len()].iter().map(|s| Expr::sym(*s)).collect()
    }

    /// Enumerates the bindings of every block in the grid, each extending `params`.
    pub fn blocks(&self, params: &Bindings) -> Result<Vec<Bindings>> {
        let extents = self
            .grid
            .iter()
            .map(|e| e.eval(params).map_err(Error::from))
            .collect::<Result<Vec<_>>>()?;
        let mut out = vec![params.clone()];
        for (axis, extent) in extents.iter().enumerate() {
            out = out
                .into_iter()
                .flat_map(|b| {
                    (0..*extent).map(move |i| {
                        let mut b = b.clone();
                        b.insert(BLOCK_IDX[axis].to_string(), i);
                        b
                    })
                })
                .collect();
        }
        Ok(out)
    }
}
