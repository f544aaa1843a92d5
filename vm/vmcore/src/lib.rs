// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Core virtualization definitions shared by the platform and its devices.

#![forbid(unsafe_code)]

pub mod save_restore;
