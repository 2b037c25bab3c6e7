// Copyright (C) 2023 Ant Group. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Fuse API layer to interconnect the transport layer with filesystem drivers.

pub mod filesystem;
pub mod server;
