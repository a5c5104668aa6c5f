//! Common imports from external crates.

pub use anyhow::{bail, ensure, format_err, Context, Error, Result};
pub use indexmap::IndexMap;
pub use itertools::Itertools;
pub use noisy_float::prelude::*;
pub use serde::{Deserialize, Serialize};
pub use std::{
    fs,
    io::{self, Write},
    iter,
    num::NonZeroUsize,
    ops::Range,
    path::{Component, Path, PathBuf},
};
pub use strum::{AsRefStr, Display as StrumDisplay, EnumIter, EnumString, IntoEnumIterator};
pub use tracing::{debug, info, warn};
