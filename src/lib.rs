/*
 * This file is part of cachemark.
 *
 * Copyright (C) 2026 cachemark contributors
 *
 * cachemark is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * cachemark is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with cachemark. If not, see <https://www.gnu.org/licenses/>.
 */

//! cachemark - admin queries over the alt-account signature index
//!
//! The `cachemark` binary answers "which accounts share a device with this
//! one" either from the running `cachemarkd` or straight from a store file.

pub mod cli;
pub mod query;
pub mod report;
