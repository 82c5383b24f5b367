//  INFO.rs
//    by Lut99
//
//  Created:
//    12 Nov 2024, 10:21:06
//  Last edited:
//    03 Mar 2025, 14:09:12
//  Auto updated?
//    Yes
//
//  Description:
//!   Defines the general [`Info`]-trait, which abstracts over the various
//!   types of disk-stored configuration files the daemon reads.
//

use std::error::Error;
use std::fmt::{Debug, Display, Formatter, Result as FResult};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};


/***** ERRORS *****/
/// Defines general errors for configs.
#[derive(Debug)]
pub enum InfoError<E: Debug> {
    /// Failed to open the input file.
    InputOpen { path: PathBuf, err: std::io::Error },

    /// Failed to deserialize a string to the config.
    StringDeserialize { err: E },
    /// Failed to deserialize a reader to the config.
    ReaderDeserialize { err: E },
    /// Failed to deserialize a file to the config.
    FileDeserialize { path: PathBuf, err: E },
}
impl<E: Error> Display for InfoError<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FResult {
        use InfoError::*;
        match self {
            InputOpen { path, .. } => write!(f, "Failed to open input file '{}'", path.display()),

            StringDeserialize { .. } => write!(f, "Failed to deserialize from string"),
            ReaderDeserialize { .. } => write!(f, "Failed to deserialize from a reader"),
            FileDeserialize { path, .. } => write!(f, "Failed to deserialize from input file '{}'", path.display()),
        }
    }
}
impl<E: 'static + Error> Error for InfoError<E> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        use InfoError::*;
        match self {
            InputOpen { err, .. } => Some(err),

            StringDeserialize { err } => Some(err),
            ReaderDeserialize { err } => Some(err),
            FileDeserialize { err, .. } => Some(err),
        }
    }
}





/***** LIBRARY *****/
/// Defines a deserializable struct that we typically use for structs that are read from disk.
pub trait Info: Clone + Debug {
    /// The types of errors that may be thrown by the deserialization function(s).
    type Error: Error;


    // Child-provided
    /// Deserializes the given string to an instance of ourselves.
    ///
    /// # Arguments
    /// - `raw`: The raw string to deserialize.
    ///
    /// # Errors
    /// This function may fail if the input string was invalid for this object.
    fn from_string(raw: impl AsRef<str>) -> Result<Self, InfoError<Self::Error>>;
    /// Deserializes the contents of the given reader to an instance of ourselves.
    ///
    /// # Arguments
    /// - `reader`: The `Read`er who's contents to deserialize.
    ///
    /// # Errors
    /// This function may fail if we failed to read from the reader or if its contents were invalid for this object.
    fn from_reader(reader: impl Read) -> Result<Self, InfoError<Self::Error>>;


    // Globally deduced
    /// Deserializes this Info from the file at the given path.
    ///
    /// # Arguments
    /// - `path`: The path where to read the file from.
    ///
    /// # Errors
    /// This function may fail if we failed to open/read from the file or if its contents were invalid for this object.
    fn from_path(path: impl AsRef<Path>) -> Result<Self, InfoError<Self::Error>> {
        let path: &Path = path.as_ref();

        // Attempt to open the given file
        let handle: File = match File::open(path) {
            Ok(handle) => handle,
            Err(err) => {
                return Err(InfoError::InputOpen { path: path.into(), err });
            },
        };

        // Pass to the child function, wrapping the error that may occur
        match Self::from_reader(handle) {
            Ok(config) => Ok(config),
            Err(InfoError::ReaderDeserialize { err }) => Err(InfoError::FileDeserialize { path: path.into(), err }),
            Err(err) => Err(err),
        }
    }
}



/// A marker trait that will let the compiler implement [`Info`] for this object using the `serde_yaml` backend.
pub trait YamlInfo<'de>: Clone + Debug + Deserialize<'de> + Serialize {}
impl<T: DeserializeOwned + Serialize + for<'de> YamlInfo<'de>> Info for T {
    type Error = serde_yaml::Error;

    fn from_string(raw: impl AsRef<str>) -> Result<Self, InfoError<Self::Error>> {
        match serde_yaml::from_str(raw.as_ref()) {
            Ok(config) => Ok(config),
            Err(err) => Err(InfoError::StringDeserialize { err }),
        }
    }

    fn from_reader(reader: impl Read) -> Result<Self, InfoError<Self::Error>> {
        match serde_yaml::from_reader(reader) {
            Ok(config) => Ok(config),
            Err(err) => Err(InfoError::ReaderDeserialize { err }),
        }
    }
}

/// A type alias for the [`InfoError`] of any [`YamlInfo`].
pub type YamlError = InfoError<serde_yaml::Error>;
