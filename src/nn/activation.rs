use std::fmt;

use candle_core::{Result, Tensor};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    Relu,
    Mish,
    Gelu,
    Swish,
    /// `relu(x)^2`
    Sqrrelu,
    Tanh,
}

impl Activation {
    pub fn forward(self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::Relu => xs.relu(),
            Self::Mish => xs.mul(&softplus(xs)?.tanh()?),
            Self::Gelu => xs.gelu_erf(),
            Self::Swish => xs.mul(&sigmoid(xs)?),
            Self::Sqrrelu => xs.relu()?.sqr(),
            Self::Tanh => xs.tanh(),
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Relu => "relu",
            Self::Mish => "mish",
            Self::Gelu => "gelu",
            Self::Swish => "swish",
            Self::Sqrrelu => "sqrrelu",
            Self::Tanh => "tanh",
        };
        write!(f, "{name}")
    }
}

fn sigmoid(xs: &Tensor) -> Result<Tensor> {
    (xs.neg()?.exp()? + 1.0)?.recip()
}

/// `relu(x) + ln(1 + e^-|x|)`, finite for large inputs.
fn softplus(xs: &Tensor) -> Result<Tensor> {
    let tail = (xs.abs()?.neg()?.exp()? + 1.0)?.log()?;
    xs.relu()? + tail
}
