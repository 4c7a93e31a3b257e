pub mod lammps;
