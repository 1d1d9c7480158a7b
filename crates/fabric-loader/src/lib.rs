// -------------------------------------------------------------------------------------------------
//  Copyright (C) 2026 Comms Fabric Contributors. All rights reserved.
//
//  Licensed under the GNU Lesser General Public License Version 3.0 (the "License");
//  You may not use this file except in compliance with the License.
//  You may obtain a copy of the License at https://www.gnu.org/licenses/lgpl-3.0.en.html
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.
// -------------------------------------------------------------------------------------------------

//! Dynamic Module Loader (C3).
//!
//! The original discovers plugins by filename-driven reflection: a file
//! named `imu.py` defines a class `imu` that the handler instantiates with
//! no arguments. This crate keeps the same discovery convention — "stem
//! selects the module" — but realizes it statically: a [`ModuleFactory`]
//! registry maps a stem to a boxed zero-argument constructor, and [`load`]
//! walks a directory of `*.module.toml` descriptors (one per plugin,
//! `name = "<stem>"`) to decide which registered factories to instantiate.

pub mod module;
pub mod registry;

pub use module::{Module, ModuleHandle};
pub use registry::{load, ModuleFactory, ModuleLoader};
