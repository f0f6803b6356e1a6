//! Matrix-free finite element infrastructure on hierarchically refined quadrilateral and
//! hexahedral meshes: cell batching for SIMD-style evaluation, task scheduling, compressed DoF
//! indices with constraints, face batches and polynomial geometric mappings.

pub mod cell_batch;
pub mod connectivity;
pub mod constraints;
pub mod dof_info;
pub mod dofs;
pub mod evaluation;
pub mod face_batch;
pub mod mapping;
pub mod mapping_info;
pub mod matrix_free;
pub mod mesh;
pub mod polynomials;
pub mod quadrature;
pub mod shape_info;
pub mod task;
pub mod tensor_product;

#[cfg(feature = "proptest-support")]
pub mod proptest;

pub extern crate nalgebra;
