mod dofs;
mod mapping;
mod matrix_free;
mod mesh;
mod shape_info;
