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

//! Engine Aggregator (C4).
//!
//! Hosts modules returned by [`fabric_loader`], runs each module's update
//! loop concurrently, periodically publishes a `negotiation` snapshot, and
//! applies inbound `control`/`config_update` envelopes read from the
//! broker's broadcast fanout.

pub mod engine;

pub use engine::Engine;
