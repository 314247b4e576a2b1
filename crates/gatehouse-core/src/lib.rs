// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! gatehouse-core: the gateway lifecycle reconciler.
//!
//! This crate keeps the persisted view of a cloud VPN gateway and its
//! registered peers in agreement with the live infrastructure. The HTTP
//! layer, the provisioner and the on-gateway agent are all collaborators
//! behind traits; everything here is testable against in-memory fakes.

pub mod error;
pub mod keys;
pub mod lock;
pub mod provider;
pub mod queue;
pub mod reconcile;
pub mod registry;
pub mod render;
pub mod settings;
pub mod store;
pub mod subnet;
