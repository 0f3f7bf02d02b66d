//! Columnar time series shared by the regularization stages.
//!
//! Every column is an array indexed by the series' shared timestamp index,
//! so resampling, filling and windowing are single passes over sorted data.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Numeric,
    Boolean,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GridCells {
    Numeric(Vec<Option<f64>>),
    Boolean(Vec<Option<bool>>),
}

impl GridCells {
    pub fn kind(&self) -> ChannelKind {
        match self {
            Self::Numeric(_) => ChannelKind::Numeric,
            Self::Boolean(_) => ChannelKind::Boolean,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Numeric(cells) => cells.len(),
            Self::Boolean(cells) => cells.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn leading_empty(&self) -> usize {
        match self {
            Self::Numeric(cells) => cells.iter().take_while(|c| c.is_none()).count(),
            Self::Boolean(cells) => cells.iter().take_while(|c| c.is_none()).count(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GridColumn {
    pub name: String,
    pub cells: GridCells,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GridSeries {
    pub step_ms: i64,
    pub timestamps: Vec<i64>,
    pub columns: Vec<GridColumn>,
}

impl GridSeries {
    pub fn empty(step_ms: i64) -> Self {
        Self {
            step_ms,
            timestamps: Vec::new(),
            columns: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<&GridColumn> {
        self.columns.iter().find(|column| column.name == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalValues {
    Numeric(Vec<f64>),
    Boolean(Vec<bool>),
}

impl SignalValues {
    pub fn kind(&self) -> ChannelKind {
        match self {
            Self::Numeric(_) => ChannelKind::Numeric,
            Self::Boolean(_) => ChannelKind::Boolean,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Numeric(values) => values.len(),
            Self::Boolean(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_f64(&self) -> Vec<f64> {
        match self {
            Self::Numeric(values) => values.clone(),
            Self::Boolean(values) => values
                .iter()
                .map(|v| if *v { 1.0 } else { 0.0 })
                .collect(),
        }
    }

    pub(crate) fn select(&self, rows: &[usize]) -> Self {
        match self {
            Self::Numeric(values) => Self::Numeric(rows.iter().map(|&i| values[i]).collect()),
            Self::Boolean(values) => Self::Boolean(rows.iter().map(|&i| values[i]).collect()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignalColumn {
    pub name: String,
    pub values: SignalValues,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignalSeries {
    pub timestamps: Vec<i64>,
    pub columns: Vec<SignalColumn>,
}

impl SignalSeries {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<&SignalColumn> {
        self.columns.iter().find(|column| column.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}
