// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Crate for dynamically creating ACPI tables.

#![forbid(unsafe_code)]

pub mod dsdt;
