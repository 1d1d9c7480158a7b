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

//! The physics simulation registry, grounded on
//! `stream_handlerv4.0.py`'s `PhysicsSimulationManager`: a flat table of
//! simulations keyed by `simulation_id`, each owning a small map of named
//! data streams fed by `register_stream`/`update`.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Serialize)]
pub struct SimulationRecord {
    pub simulation_id: String,
    pub config: Value,
    pub status: String,
    pub streams: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

/// Concurrent registry of simulations, one entry per `simulation_id`.
#[derive(Default)]
pub struct PhysicsRegistry {
    simulations: DashMap<String, SimulationRecord>,
}

impl PhysicsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, simulation_id: &str, config: Value) -> SimulationRecord {
        let now = Utc::now();
        let record = SimulationRecord {
            simulation_id: simulation_id.to_string(),
            config,
            status: "registered".to_string(),
            streams: Map::new(),
            created_at: now,
            last_update: now,
        };
        self.simulations.insert(simulation_id.to_string(), record.clone());
        record
    }

    pub fn contains(&self, simulation_id: &str) -> bool {
        self.simulations.contains_key(simulation_id)
    }

    pub fn get(&self, simulation_id: &str) -> Option<SimulationRecord> {
        self.simulations.get(simulation_id).map(|e| e.clone())
    }

    pub fn all(&self) -> Map<String, Value> {
        self.simulations
            .iter()
            .map(|e| (e.key().clone(), serde_json::to_value(e.value()).unwrap_or(Value::Null)))
            .collect()
    }

    pub fn update_status(&self, simulation_id: &str, status: &str) -> bool {
        match self.simulations.get_mut(simulation_id) {
            Some(mut entry) => {
                entry.status = status.to_string();
                entry.last_update = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Registers (or replaces) a named stream on a simulation and returns the
    /// synthetic `<simulation_id>_<stream_id>` key the broker should inject
    /// into the broadcast active-streams table.
    pub fn register_stream(&self, simulation_id: &str, stream_id: &str, data: Map<String, Value>) -> Option<String> {
        let mut entry = self.simulations.get_mut(simulation_id)?;
        entry.streams.insert(stream_id.to_string(), Value::Object(data));
        entry.last_update = Utc::now();
        Some(format!("{simulation_id}_{stream_id}"))
    }

    /// Merges `data` into an already-registered stream's value and returns
    /// the synthetic key, same as [`Self::register_stream`].
    pub fn update_stream(&self, simulation_id: &str, stream_id: &str, data: Map<String, Value>) -> Option<String> {
        let mut entry = self.simulations.get_mut(simulation_id)?;
        match entry.streams.get_mut(stream_id) {
            Some(Value::Object(existing)) => {
                for (k, v) in data {
                    existing.insert(k, v);
                }
            }
            _ => {
                entry.streams.insert(stream_id.to_string(), Value::Object(data));
            }
        }
        entry.last_update = Utc::now();
        Some(format!("{simulation_id}_{stream_id}"))
    }

    pub fn remove(&self, simulation_id: &str) -> bool {
        self.simulations.remove(simulation_id).is_some()
    }
}
