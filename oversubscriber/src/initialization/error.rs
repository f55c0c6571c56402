use std::{
    error::Error,
    fmt::{self, Display},
};

use rand_distr::{NormalError, uniform::Error as UniformError};

pub type Result<T> = std::result::Result<T, RandErr>;

/// The parameters of a `RandParamGen` distribution were rejected.
#[derive(Debug)]
pub enum RandErr {
    Uniform {
        low: f32,
        high: f32,
        inclusive: bool,
        source: UniformError,
    },
    Normal {
        mean: f32,
        std_dev: f32,
        source: NormalError,
    },
}

impl Display for RandErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uniform {
                low,
                high,
                inclusive,
                ..
            } => {
                let close = if *inclusive { ']' } else { ')' };
                write!(f, "invalid uniform row initializer over [{low}, {high}{close}")
            }
            Self::Normal { mean, std_dev, .. } => write!(
                f,
                "invalid normal row initializer with mean {mean} and std_dev {std_dev}"
            ),
        }
    }
}

impl Error for RandErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Uniform { source, .. } => Some(source),
            Self::Normal { source, .. } => Some(source),
        }
    }
}
