// Copyright (C) 2023 Ant Group. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Fuse Application Binary Interfaces(ABI).

/// Linux Fuse Application Binary Interfaces.
pub mod fuse_abi;
